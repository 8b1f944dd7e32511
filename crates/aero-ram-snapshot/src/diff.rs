/// Content hash stored in the index for every saved nonzero page.
pub type PageHash = [u8; 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    /// Every byte is zero; stored without payload.
    Zero,
    /// Identical to the base page of an incremental save; stored without payload.
    Unchanged,
    /// Needs a payload.
    Changed,
}

/// Stateless page classifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct PageDiffer;

impl PageDiffer {
    /// Classify `page` against the base page of an incremental save, or against nothing for a
    /// full save.
    ///
    /// Pages equal to their base are `Unchanged`. Otherwise zero detection wins over `Changed`,
    /// so a page that became all-zero since the base is stored as `Zero` and never needs
    /// decompression on load.
    pub fn classify(page: &[u8], prior: Option<&[u8]>) -> PageClass {
        if let Some(prior) = prior {
            debug_assert_eq!(page.len(), prior.len());
            if page == prior {
                return PageClass::Unchanged;
            }
        }
        if is_zeroed(page) {
            PageClass::Zero
        } else {
            PageClass::Changed
        }
    }

    /// Like [`PageDiffer::classify`], but against what an earlier save's index recorded for the
    /// page instead of the page bytes themselves.
    pub fn classify_hashed(page: &[u8], prior: PriorPage) -> (PageClass, Option<PageHash>) {
        let zero = is_zeroed(page);
        match prior {
            PriorPage::Zero if zero => (PageClass::Unchanged, None),
            PriorPage::Hashed(prior_hash) if !zero => {
                let hash = hash_page(page);
                if hash == prior_hash {
                    (PageClass::Unchanged, Some(hash))
                } else {
                    (PageClass::Changed, Some(hash))
                }
            }
            _ if zero => (PageClass::Zero, None),
            _ => (PageClass::Changed, Some(hash_page(page))),
        }
    }
}

/// What a base save knows about a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorPage {
    Zero,
    Hashed(PageHash),
    Unknown,
}

pub fn hash_page(page: &[u8]) -> PageHash {
    let hash = blake3::hash(page);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash.as_bytes()[..16]);
    out
}

pub fn is_zeroed(buf: &[u8]) -> bool {
    let (chunks, rest) = buf.split_at(buf.len() - buf.len() % 8);
    chunks
        .chunks_exact(8)
        .all(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) == 0)
        && rest.iter().all(|&b| b == 0)
}
