use serde::{Deserialize, Serialize};

/// Full content snapshot. Sent on join and for accepted edits, and submitted
/// by the active writer.
pub const STATE: &str = "state";
/// Member count notice.
pub const NUMBER_USER: &str = "number_user";
/// Client asks for write permission.
pub const WRITE: &str = "write";
/// Server grants write permission.
pub const CAN_WRITE: &str = "can_write";
/// Server revokes write permission.
pub const CAN_NOT_WRITE: &str = "can_not_write";

/// The only frame on the wire: `{"Comm": "...", "Data": "..."}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Command {
    #[serde(rename = "Comm")]
    pub comm: String,
    #[serde(rename = "Data", default)]
    pub data: String,
}

/// What a client frame asks the session to do.
#[derive(Debug, PartialEq, Eq)]
pub enum Request<'a> {
    Write,
    State(&'a str),
    Unknown(&'a str),
}

impl Command {
    pub fn new(comm: &str, data: impl Into<String>) -> Self {
        Self {
            comm: comm.to_string(),
            data: data.into(),
        }
    }

    pub fn state(content: impl Into<String>) -> Self {
        Self::new(STATE, content)
    }

    pub fn number_user(count: usize) -> Self {
        Self::new(NUMBER_USER, count.to_string())
    }

    pub fn can_write() -> Self {
        Self::new(CAN_WRITE, "")
    }

    pub fn can_not_write() -> Self {
        Self::new(CAN_NOT_WRITE, "")
    }

    pub fn request(&self) -> Request<'_> {
        match self.comm.as_str() {
            WRITE => Request::Write,
            STATE => Request::State(&self.data),
            other => Request::Unknown(other),
        }
    }
}
