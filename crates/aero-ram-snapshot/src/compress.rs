/// Per-page LZ4 block compression.
#[derive(Debug, Default, Clone)]
pub struct PageCompressor {
    scratch: Vec<u8>,
}

impl PageCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Worst-case LZ4 output for an input of `raw_len` bytes.
    pub fn max_compressed_len(raw_len: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(raw_len)
    }

    /// Compress one page. Returns `None` when the result would not be strictly smaller than the
    /// input, in which case the page is stored raw.
    pub fn compress(&mut self, raw: &[u8]) -> Option<&[u8]> {
        let max = Self::max_compressed_len(raw.len());
        if self.scratch.len() < max {
            self.scratch.resize(max, 0);
        }
        let len = match lz4_flex::block::compress_into(raw, &mut self.scratch) {
            Ok(len) => len,
            Err(_) => return None,
        };
        if len >= raw.len() {
            return None;
        }
        Some(&self.scratch[..len])
    }

    /// Decompress a page of `page_size` bytes into a new buffer.
    pub fn decompress(compressed: &[u8], page_size: usize) -> Result<Vec<u8>, &'static str> {
        let mut out = vec![0u8; page_size];
        Self::decompress_into(compressed, &mut out)?;
        Ok(out)
    }

    /// Decompress into `out`, which must be exactly one page. Fails unless the compressed stream
    /// produces exactly `out.len()` bytes.
    pub fn decompress_into(compressed: &[u8], out: &mut [u8]) -> Result<(), &'static str> {
        if compressed.len() >= out.len() {
            return Err("compressed payload is not smaller than the page");
        }
        match lz4_flex::block::decompress_into(compressed, out) {
            Ok(n) if n == out.len() => Ok(()),
            Ok(_) => Err("decompressed length does not match page size"),
            Err(_) => Err("lz4 stream is malformed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repetitive_page_compresses_and_roundtrips() {
        let mut page = vec![0u8; 4096];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 7) as u8;
        }
        let mut compressor = PageCompressor::new();
        let compressed = compressor.compress(&page).expect("page should compress").to_vec();
        assert!(compressed.len() < page.len());

        let mut out = vec![0xFFu8; 4096];
        PageCompressor::decompress_into(&compressed, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn incompressible_page_falls_back_to_raw() {
        // xorshift noise does not compress with LZ4.
        let mut state = 0x1234_5678_9abc_def0u64;
        let page: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        assert!(PageCompressor::new().compress(&page).is_none());
    }

    #[test]
    fn short_decompression_is_rejected() {
        let page = vec![0x11u8; 4096];
        let mut compressor = PageCompressor::new();
        let compressed = compressor.compress(&page).unwrap().to_vec();

        let mut bigger = vec![0u8; 8192];
        assert!(PageCompressor::decompress_into(&compressed, &mut bigger).is_err());
        assert_eq!(PageCompressor::decompress(&compressed, 4096).unwrap(), page);
        assert!(PageCompressor::decompress(&compressed, 2048).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let mut out = vec![0u8; 4096];
        assert!(PageCompressor::decompress_into(&[0xF0, 0x01, 0x02], &mut out).is_err());
    }
}
