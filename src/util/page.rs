use std::sync::OnceLock;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(page_size::get)
}

/// Bytes to map for a counter's ring buffer: one control page followed by
/// `data_pages` data pages.
pub fn ring_mapping_len(data_pages: usize) -> usize {
    (1 + data_pages) * page_size()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size() {
        assert!(page_size().is_power_of_two());
        assert_eq!(page_size(), page_size::get());
    }

    #[test]
    fn test_ring_mapping_len() {
        assert_eq!(ring_mapping_len(1), 2 * page_size());
        assert_eq!(ring_mapping_len(8), 9 * page_size());
    }
}
