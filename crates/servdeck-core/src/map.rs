use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Snapshot of the map currently loaded on a server.
///
/// Only the uid is interpreted; every other field the server sends is kept
/// verbatim in `extra` and serialized back out untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapInfo {
    #[serde(alias = "UId")]
    pub uid: String,
    #[serde(alias = "Name", default)]
    pub name: String,
    #[serde(alias = "Author", default)]
    pub author: String,
    #[serde(alias = "FileName", default)]
    pub file_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MapInfo {
    pub fn new(uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            author: String::new(),
            file_name: String::new(),
            extra: Map::new(),
        }
    }
}
