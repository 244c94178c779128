use serde::{Deserialize, Serialize};

use super::{
    Icon,
    content::{EmbeddedResource, RawImageContent},
};

/// A prompt template exposed by an upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<PromptArgument>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icons: Option<Vec<Icon>>,
}

impl Prompt {
    pub fn new<N, D>(
        name: N,
        description: Option<D>,
        arguments: Option<Vec<PromptArgument>>,
    ) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        Prompt {
            name: name.into(),
            title: None,
            description: description.map(Into::into),
            arguments,
            icons: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PromptMessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptMessageContent {
    Text {
        text: String,
    },
    Image {
        #[serde(flatten)]
        image: RawImageContent,
    },
    Resource {
        resource: EmbeddedResource,
    },
}

impl PromptMessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptMessageRole,
    pub content: PromptMessageContent,
}

impl PromptMessage {
    pub fn new_text(role: PromptMessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: PromptMessageContent::text(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_prompt_new() {
        let prompt = Prompt::new(
            "greet",
            Some("say hello"),
            Some(vec![PromptArgument {
                name: "who".into(),
                title: None,
                description: None,
                required: Some(true),
            }]),
        );
        assert_eq!(prompt.name, "greet");
        assert_eq!(prompt.arguments.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_prompt_message_serialization() {
        let message = PromptMessage::new_text(PromptMessageRole::User, "hi");
        let serialized = serde_json::to_value(&message).unwrap();
        assert_eq!(serialized["role"], "user");
        assert_eq!(serialized["content"]["type"], "text");
    }

    #[test]
    fn test_prompt_deserialization() {
        let prompt: Prompt = serde_json::from_value(json!({
            "name": "greet",
            "description": "say hello"
        }))
        .unwrap();
        assert_eq!(prompt.description.as_deref(), Some("say hello"));
        assert!(prompt.arguments.is_none());
    }
}
