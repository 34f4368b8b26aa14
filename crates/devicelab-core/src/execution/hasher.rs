//! Stable identifiers for execution steps.
//!
//! MurmurHash3 x64 128-bit with seed 0, rendered as 32 lowercase hex digits.
//! The value is a storage key, not a security boundary.

use super::steps::ExecutionStep;
use uuid::Uuid;

/// Hash `input` to 32 lowercase hex characters.
pub fn hash(input: &str) -> String {
    format!("{:032x}", murmur3_x64_128(input.as_bytes()))
}

fn murmur3_x64_128(mut bytes: &[u8]) -> u128 {
    match murmur3::murmur3_x64_128(&mut bytes, 0) {
        Ok(digest) => digest,
        // `Read` for `&[u8]` never returns an error.
        Err(e) => unreachable!("murmur3 over an in-memory slice failed: {e}"),
    }
}

/// The string hashed for `step` within `session_id`.
///
/// `{session}/{plan_repetition}/{order}/{step_repetition}`, followed by
/// `/{xctest_id}` when the step has exactly one test case.
pub fn step_key(session_id: Uuid, step: &ExecutionStep) -> String {
    let mut key = format!(
        "{}/{}/{}/{}",
        session_id,
        step.plan_repetition,
        step.order(),
        step.step_repetition
    );
    if let [test_case] = step.test_cases.as_slice() {
        key.push('/');
        key.push_str(&test_case.xctest_id);
    }
    key
}

/// Identifier of `step` within `session_id`, used to name its result files.
pub fn hash_session_execution_step(session_id: Uuid, step: &ExecutionStep) -> String {
    hash(&step_key(session_id, step))
}
