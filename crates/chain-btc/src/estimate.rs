/// Fixed-weight transaction size estimator.
///
/// Used only while choosing inputs, before a real transaction exists. The
/// defaults describe legacy P2PKH spends with compressed keys, which is what
/// the address pool hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEstimator {
    /// Version, locktime and the input/output count varints.
    pub overhead: u64,
    /// One signed input.
    pub per_input: u64,
    /// One addressed output.
    pub per_output: u64,
    /// The `OP_RETURN` token payload output.
    pub token_output: u64,
}

impl Default for SizeEstimator {
    fn default() -> Self {
        Self {
            overhead: 10,
            per_input: 148,
            per_output: 34,
            token_output: 31,
        }
    }
}

impl SizeEstimator {
    /// Estimated size in bytes for the given shape.
    pub fn estimate(&self, inputs: usize, outputs: usize, has_token_output: bool) -> u64 {
        let token = if has_token_output { self.token_output } else { 0 };
        self.overhead + inputs as u64 * self.per_input + outputs as u64 * self.per_output + token
    }

    /// Fee for the given shape at `fee_rate` sat/byte.
    pub fn estimate_fee(
        &self,
        inputs: usize,
        outputs: usize,
        has_token_output: bool,
        fee_rate: u64,
    ) -> u64 {
        self.estimate(inputs, outputs, has_token_output)
            .saturating_mul(fee_rate)
    }
}
