/// One bit per page; a set bit means allocated.
///
/// Bits past `pages` in the last word are never set. Words past the last one
/// covering `pages` are not kept.
pub(crate) struct PageBitmap {
    words: &'static mut [u64],
    pages: usize,
}

impl PageBitmap {
    /// Keep the first words of `words` covering `pages` and clear them.
    pub(crate) fn new(words: &'static mut [u64], pages: usize) -> Self {
        debug_assert!(words.len() * 64 >= pages);
        let (words, _) = words.split_at_mut(Self::words_for(pages));
        words.fill(0);
        Self { words, pages }
    }

    /// Bitmap words needed for `pages` pages.
    pub(crate) const fn words_for(pages: usize) -> usize {
        pages.div_ceil(64)
    }

    #[inline]
    pub(crate) const fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    pub(crate) fn is_set(&self, page: usize) -> bool {
        self.words[page / 64] & (1 << (page % 64)) != 0
    }

    pub(crate) fn set_range(&mut self, first: usize, count: usize) {
        for page in first..first + count {
            self.words[page / 64] |= 1 << (page % 64);
        }
    }

    pub(crate) fn clear_range(&mut self, first: usize, count: usize) {
        for page in first..first + count {
            self.words[page / 64] &= !(1 << (page % 64));
        }
    }

    /// Index of the first set bit in `[first, first + count)`, if any.
    pub(crate) fn first_set_in(&self, first: usize, count: usize) -> Option<usize> {
        (first..first + count).find(|&p| self.is_set(p))
    }

    /// First run of `count` clear bits starting at `first + k * step`.
    pub(crate) fn find_clear_run(&self, count: usize, first: usize, step: usize) -> Option<usize> {
        if count == 0 || step == 0 {
            return None;
        }
        let mut start = first;
        while start.checked_add(count)? <= self.pages {
            // Whole words that are full can be skipped at once.
            if self.words[start / 64] == u64::MAX && start % 64 == 0 && step <= 64 {
                start += 64usize.div_ceil(step) * step;
                continue;
            }
            match self.first_set_in(start, count) {
                None => return Some(start),
                Some(busy) => start = first + (busy + 1 - first).div_ceil(step) * step,
            }
        }
        None
    }

    pub(crate) fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}
