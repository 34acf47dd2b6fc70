//! Chunked upload sessions and the keys of their transient parts.

/// An in-progress chunked upload.
///
/// Sessions are never stored. They exist only to derive the keys of the
/// transient part objects, which live at `{target_key}/{upload_id}/{part}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,
    pub target_key: String,
}

impl UploadSession {
    pub fn new(upload_id: impl Into<String>, target_key: impl Into<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            target_key: target_key.into(),
        }
    }

    /// Key of the transient object holding `part_number`.
    pub fn part_key(&self, part_number: u32) -> String {
        format!("{}/{}/{}", self.target_key, self.upload_id, part_number)
    }

    /// Part number encoded in `key`, if it is one of this session's parts.
    pub fn part_number_of(&self, key: &str) -> Option<u32> {
        let rest = key
            .strip_prefix(self.target_key.as_str())?
            .strip_prefix('/')?
            .strip_prefix(self.upload_id.as_str())?
            .strip_prefix('/')?;
        rest.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_key_is_target_then_upload_then_number() {
        let session = UploadSession::new("u1", "ds/video.mp4");
        assert_eq!(session.part_key(7), "ds/video.mp4/u1/7");
    }

    #[test]
    fn part_number_round_trips_through_key() {
        let session = UploadSession::new("u1", "ds/video.mp4");
        assert_eq!(session.part_number_of(&session.part_key(42)), Some(42));
        assert_eq!(session.part_number_of("ds/video.mp4/u2/1"), None);
        assert_eq!(session.part_number_of("ds/video.mp4"), None);
    }
}
