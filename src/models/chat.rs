use serde::{ Serialize, Deserialize };
use std::fmt;

/// Author of a chat turn. Unknown roles are kept verbatim but not counted.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    #[default]
    User,
    Assistant,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Other(other) => other,
        }
    }

    /// Role name with its first character upper-cased, as shown in transcripts.
    pub fn display_name(&self) -> String {
        let name = self.as_str();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        match value.trim() {
            "" | "user" => Role::User,
            // "ai" is what older transcripts used for the assistant side.
            "assistant" | "ai" => Role::Assistant,
            other => Role::Other(other.to_string()),
        }
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Role::from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total: usize,
    pub user_count: usize,
    pub assistant_count: usize,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
}

impl HistoryStats {
    pub fn from_messages(messages: &[Message]) -> Self {
        let mut stats = HistoryStats {
            total: messages.len(),
            first_timestamp: messages.first().map(|m| m.timestamp.clone()),
            last_timestamp: messages.last().map(|m| m.timestamp.clone()),
            ..Default::default()
        };
        for msg in messages {
            match msg.role {
                Role::User => stats.user_count += 1,
                Role::Assistant => stats.assistant_count += 1,
                Role::Other(_) => {}
            }
        }
        stats
    }
}
