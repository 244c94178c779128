use serde::{Deserialize, Serialize};

use super::{AnnotateAble, Annotated, resource::ResourceContents};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawImageContent {
    /// Base64-encoded image data.
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEmbeddedResource {
    pub resource: ResourceContents,
}

pub type EmbeddedResource = Annotated<RawEmbeddedResource>;

/// One block of tool-call or prompt output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawContent {
    Text(RawTextContent),
    Image(RawImageContent),
    Resource(RawEmbeddedResource),
}

pub type Content = Annotated<RawContent>;

impl RawContent {
    pub fn text(text: impl Into<String>) -> Self {
        RawContent::Text(RawTextContent { text: text.into() })
    }

    pub fn as_text(&self) -> Option<&RawTextContent> {
        match self {
            RawContent::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        RawContent::text(text).no_annotation()
    }
}
