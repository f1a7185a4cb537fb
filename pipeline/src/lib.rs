use std::sync::Arc;

pub mod builds;
pub mod deploy;
pub mod input;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] registry::Error),
    // resolution errors surface out of the shared single-flight cache behind an Arc
    #[error("{0}")]
    Resolve(Arc<registry::Error>),
    #[error("{0}")]
    Input(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("one or more deploys failed")]
    DeployFailed,
}

// tab-indented pretty printing, matching the shape of the cache file and lookup output
pub fn to_tab_indented_json<T: serde::Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8(buf).expect("serde_json emits utf-8"))
}
