/// Distance between consecutive color bases
pub const COLOR_STRIDE: u64 = 3;

/// Traversal color of a vertex within one subsystem pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    White,
    Gray,
    Black,
}

impl Color {
    fn offset(self) -> u64 {
        match self {
            Color::White => 0,
            Color::Gray => 1,
            Color::Black => 2,
        }
    }
}

/// Epoch that stored colors are compared against.
///
/// A stored value at or below the base reads as white, so bumping the base
/// by [`COLOR_STRIDE`] resets every vertex at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorEpoch {
    base: u64,
}

impl ColorEpoch {
    pub fn new(base: u64) -> Self {
        Self { base }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Start a new epoch; every previous marking becomes white
    pub fn reset(&mut self) {
        self.base += COLOR_STRIDE;
    }

    /// Value to store for `color` in this epoch
    pub fn value(&self, color: Color) -> u64 {
        self.base + color.offset()
    }

    /// Interpret a stored value in this epoch
    pub fn classify(&self, stored: u64) -> Color {
        if stored <= self.base {
            Color::White
        } else if stored == self.base + 1 {
            Color::Gray
        } else {
            Color::Black
        }
    }
}
