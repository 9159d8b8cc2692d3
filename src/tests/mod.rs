//! Cross-module tests: entropy coding streams and full encode/decode runs.

mod codec;
mod laplace_stream;
mod pvq_codewords;

/// Pseudo-random source shared by the entropy-coder harnesses.
pub(crate) struct TestRng(u32);

impl TestRng {
    pub fn new(seed: u32) -> Self {
        TestRng(seed)
    }

    pub fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1103515245).wrapping_add(12345);
        self.0 >> 16
    }
}
