//! Message types
//!
//! Defines chat message structures and roles, and the fallback prompt layout
//! used to turn a conversation into generation input.

use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message from the user
    User,
    /// Message from the AI assistant
    Assistant,
    /// System prompt
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message sender
    pub role: Role,
    /// The content of the message
    pub content: String,
}

impl ChatMessage {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Conversation turns collected before rendering a prompt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Renders every turn as `<|role|>content` on its own line, followed by
    /// an open assistant tag for the model to continue from.
    pub fn render_prompt(&self) -> String {
        let mut prompt = String::new();
        for message in &self.messages {
            prompt.push_str("<|");
            prompt.push_str(message.role.as_str());
            prompt.push_str("|>");
            prompt.push_str(&message.content);
            prompt.push('\n');
        }
        prompt.push_str("<|assistant|>");
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = ChatMessage::new(Role::User, "Hello, world!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, world!");
    }

    #[test]
    fn test_role_equality() {
        assert_eq!(Role::User, Role::User);
        assert_ne!(Role::User, Role::Assistant);
    }

    #[test]
    fn test_render_prompt() {
        let mut history = ChatHistory::new();
        history.push(Role::System, "Be brief.");
        history.push(Role::User, "Hi");
        history.push(Role::Assistant, "Hello!");
        history.push(Role::User, "Bye");

        assert_eq!(
            history.render_prompt(),
            "<|system|>Be brief.\n<|user|>Hi\n<|assistant|>Hello!\n<|user|>Bye\n<|assistant|>"
        );
    }

    #[test]
    fn test_empty_history_still_opens_assistant_turn() {
        let mut history = ChatHistory::new();
        assert_eq!(history.render_prompt(), "<|assistant|>");
        history.push(Role::User, "x");
        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::new(Role::Assistant, "ok")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"ok"}"#);
    }
}
