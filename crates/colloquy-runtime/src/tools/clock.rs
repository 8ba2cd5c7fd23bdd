//! Clock tool

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use colloquy_core::{
    error::Result,
    tool::{Tool, ToolArguments, ToolResult, ToolSchema},
};
use serde_json::json;

/// Current date and time
pub struct CurrentTimeTool;

fn render(now: DateTime<Utc>, format: &str) -> String {
    match format {
        "iso" => now.to_rfc3339(),
        "unix" => now.timestamp().to_string(),
        _ => now
            .with_timezone(&Local)
            .format("%A, %B %-d, %Y %H:%M:%S %Z")
            .to_string(),
    }
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::builder("current_time", "Get the current date and time.")
            .param("format", "string", "One of iso, unix or human (default: human)", false)
            .build()
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<ToolResult> {
        let format = arguments.get("format").and_then(|v| v.as_str()).unwrap_or("human");
        Ok(ToolResult::success(json!(render(Utc::now(), format))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_formats() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap();
        assert_eq!(render(now, "iso"), "2024-03-09T14:05:00+00:00");
        assert_eq!(render(now, "unix"), "1709993100");
        assert!(render(now, "human").contains("2024"));
    }
}
