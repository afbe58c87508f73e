//! Transcript export: JSON, CSV, and a self-contained HTML page.

use crate::debate::state::{DebateMessage, DebateRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Html,
}

impl ExportFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            "html" => Some(Self::Html),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Html => "html",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Render a debate transcript in the requested format.
pub fn export_transcript(
    debate: &DebateRecord,
    messages: &[DebateMessage],
    format: ExportFormat,
) -> Result<String, ExportError> {
    match format {
        ExportFormat::Json => {
            serde_json::to_string_pretty(&serde_json::json!({
                "debate": debate,
                "messages": messages,
            }))
            .map_err(|e| ExportError::Serialization(e.to_string()))
        }
        ExportFormat::Csv => Ok(to_csv(messages)),
        ExportFormat::Html => Ok(to_html(debate, messages)),
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn to_csv(messages: &[DebateMessage]) -> String {
    let mut out = String::from("round,agent,role,confidence,content\n");
    for message in messages {
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            message.round,
            csv_escape(&message.agent),
            csv_escape(&message.role),
            message
                .confidence
                .map(|c| c.to_string())
                .unwrap_or_default(),
            csv_escape(&message.content),
        ));
    }
    out
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn to_html(debate: &DebateRecord, messages: &[DebateMessage]) -> String {
    let mut rows = String::new();
    for message in messages {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            message.round,
            html_escape(&message.agent),
            html_escape(&message.role),
            html_escape(&message.content),
        ));
    }
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\">\
         <title>{title}</title></head><body>\n\
         <h1>{title}</h1>\n\
         <p>{agents} agents, {rounds} rounds, outcome: {state}</p>\n\
         <table border=\"1\"><tr><th>Round</th><th>Agent</th><th>Role</th>\
         <th>Message</th></tr>\n{rows}</table>\n</body></html>\n",
        title = html_escape(&debate.task),
        agents = debate.agents.len(),
        rounds = debate.rounds_used,
        state = debate.state,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fixture() -> (DebateRecord, Vec<DebateMessage>) {
        let debate = DebateRecord::new(
            "d-1",
            "pick-x",
            "Pick X or Y",
            &["a".to_string(), "b".to_string()],
            2,
        );
        let messages = vec![DebateMessage {
            debate_id: "d-1".to_string(),
            round: 1,
            agent: "a".to_string(),
            role: "proposer".to_string(),
            content: "I pick X, because \"X\" wins".to_string(),
            confidence: Some(0.8),
            citations: vec![],
            created_at: Utc::now(),
        }];
        (debate, messages)
    }

    #[test]
    fn test_json_export_roundtrips() {
        let (debate, messages) = fixture();
        let json = export_transcript(&debate, &messages, ExportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["debate"]["slug"], "pick-x");
        assert_eq!(value["messages"][0]["agent"], "a");
    }

    #[test]
    fn test_csv_escapes_quotes_and_commas() {
        let (debate, messages) = fixture();
        let csv = export_transcript(&debate, &messages, ExportFormat::Csv).unwrap();
        assert!(csv.starts_with("round,agent,role,confidence,content\n"));
        assert!(csv.contains("\"I pick X, because \"\"X\"\" wins\""));
    }

    #[test]
    fn test_html_escapes_markup() {
        let (debate, mut messages) = fixture();
        messages[0].content = "<script>alert(1)</script>".to_string();
        let html = export_transcript(&debate, &messages, ExportFormat::Html).unwrap();
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>alert"));
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(ExportFormat::parse("JSON"), Some(ExportFormat::Json));
        assert_eq!(ExportFormat::parse("csv"), Some(ExportFormat::Csv));
        assert_eq!(ExportFormat::parse("html"), Some(ExportFormat::Html));
        assert_eq!(ExportFormat::parse("pdf"), None);
    }
}
