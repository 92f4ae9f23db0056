use crate::history::HistoryError;
use crate::models::chat::Message;
use std::fmt;
use std::str::FromStr;

const CSV_HEADER: &str = "timestamp,role,message\n";
const TEXT_TITLE: &str = "=== AI Chat History ===\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Text,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json; charset=utf-8",
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Text => "text/plain; charset=utf-8",
        }
    }

    pub fn render(&self, messages: &[Message]) -> Result<String, HistoryError> {
        match self {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(messages)?),
            ExportFormat::Csv => Ok(to_csv(messages)),
            ExportFormat::Text => Ok(to_text(messages)),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "text" | "txt" => Ok(ExportFormat::Text),
            _ => Err(HistoryError::UnsupportedFormat(s.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Text => "text",
        };
        f.write_str(name)
    }
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

fn to_csv(messages: &[Message]) -> String {
    let mut csv = String::from(CSV_HEADER);
    for msg in messages {
        csv.push_str(
            &format!(
                "{},{},{}\n",
                quote(&msg.timestamp),
                quote(msg.role.as_str()),
                quote(&msg.content)
            )
        );
    }
    csv
}

fn to_text(messages: &[Message]) -> String {
    let mut txt = String::from(TEXT_TITLE);
    for msg in messages {
        txt.push_str(
            &format!("[{}] {}:\n{}\n\n", msg.timestamp, msg.role.display_name(), msg.content)
        );
    }
    txt
}
