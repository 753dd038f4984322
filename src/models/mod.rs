//! Domain model module declarations.

pub mod command;
pub mod device;
pub mod recording;

/// Longest identifier accepted as a single path segment.
const MAX_SEGMENT_LEN: usize = 128;

/// Whether `id` can be used verbatim as one file-system path segment.
///
/// Device, camera and session identifiers end up in directory and file
/// names on both the agent and the coordinator, so only ASCII
/// alphanumerics plus `-`, `_` and `.` are accepted, and the relative
/// segments `.`/`..` are refused.
#[must_use]
pub fn is_path_safe(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SEGMENT_LEN
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
