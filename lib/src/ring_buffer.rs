/// Fixed-capacity ring buffer over a backing array with head/tail/count
/// indices.  The TCP send and receive windows are built on the slice
/// operations at the bottom of this file.
#[derive(Debug)]
pub struct RingBuffer<T, const N: usize> {
    data: [T; N],
    head: u32,
    tail: u32,
    count: u32,
}

impl<T: Copy, const N: usize> RingBuffer<T, N> {
    /// Create a new ring buffer with all elements set to the given value.
    /// This is const-compatible and can be used for static initialization.
    #[inline(always)]
    pub const fn new_with(value: T) -> Self {
        Self {
            data: [value; N],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    /// Returns the current number of elements in the buffer.
    #[inline(always)]
    pub const fn len(&self) -> u32 {
        self.count
    }

    #[inline(always)]
    pub const fn capacity(&self) -> u32 {
        N as u32
    }

    /// Free slots left before the buffer is full.
    #[inline(always)]
    pub const fn space(&self) -> u32 {
        N as u32 - self.count
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.count >= self.capacity()
    }

    /// Push with overwrite of the oldest element when full.
    #[inline(always)]
    pub fn push_overwrite(&mut self, value: T) {
        if self.is_full() {
            self.tail = (self.tail + 1) % self.capacity();
            self.count -= 1;
        }
        self.data[self.head as usize] = value;
        self.head = (self.head + 1) % self.capacity();
        self.count += 1;
    }

    /// Push without overwrite; returns true on success, false if full.
    #[inline(always)]
    pub fn try_push(&mut self, value: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.data[self.head as usize] = value;
        self.head = (self.head + 1) % self.capacity();
        self.count += 1;
        true
    }

    /// Pop oldest element; returns Some(value) or None when empty.
    #[inline(always)]
    pub fn try_pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.data[self.tail as usize];
        self.tail = (self.tail + 1) % self.capacity();
        self.count -= 1;
        Some(value)
    }

    /// Peek at the oldest element without removing it.
    #[inline(always)]
    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        Some(&self.data[self.tail as usize])
    }

    // =========================================================================
    // Slice operations
    // =========================================================================

    /// Append as much of `src` as fits.  Returns the number of elements taken.
    pub fn push_slice(&mut self, src: &[T]) -> usize {
        let n = src.len().min(self.space() as usize);
        for &value in &src[..n] {
            self.data[self.head as usize] = value;
            self.head = (self.head + 1) % self.capacity();
        }
        self.count += n as u32;
        n
    }

    /// Remove up to `dst.len()` of the oldest elements into `dst`.
    pub fn pop_into(&mut self, dst: &mut [T]) -> usize {
        let n = self.copy_at(0, dst);
        self.discard(n);
        n
    }

    /// Copy elements starting `offset` past the oldest one into `dst`
    /// without consuming them.  Returns the number copied.
    pub fn copy_at(&self, offset: usize, dst: &mut [T]) -> usize {
        let len = self.count as usize;
        if offset >= len {
            return 0;
        }
        let n = dst.len().min(len - offset);
        let mut idx = (self.tail as usize + offset) % N;
        for slot in dst[..n].iter_mut() {
            *slot = self.data[idx];
            idx = (idx + 1) % N;
        }
        n
    }

    /// Drop up to `n` of the oldest elements.  Returns the number dropped.
    pub fn discard(&mut self, n: usize) -> usize {
        let n = n.min(self.count as usize);
        if n > 0 {
            self.tail = ((self.tail as usize + n) % N) as u32;
            self.count -= n as u32;
        }
        n
    }
}

impl<T: Copy + Default, const N: usize> RingBuffer<T, N> {
    #[inline(always)]
    pub fn new() -> Self {
        Self {
            data: [T::default(); N],
            head: 0,
            tail: 0,
            count: 0,
        }
    }
}

impl<T: Copy + Default, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
