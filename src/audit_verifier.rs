use crate::audit::{chain_hash, ChainedAuditLine};
use crate::errors::{McpError, McpResult};
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditVerification {
    pub lines_checked: usize,
    /// 1-based line number of the first line whose hash or link is wrong.
    pub first_broken_line: Option<usize>,
    pub last_hash: Option<String>,
}

impl AuditVerification {
    pub fn is_intact(&self) -> bool {
        self.first_broken_line.is_none()
    }
}

/// Recompute the hash chain of a JSONL audit log.
pub fn verify_audit_log(path: impl AsRef<Path>) -> McpResult<AuditVerification> {
    let file = File::open(path.as_ref()).map_err(|e| McpError::io("open audit log", e))?;
    let reader = BufReader::new(file);

    let mut previous_hash: Option<String> = None;
    let mut lines_checked = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| McpError::io("read audit log", e))?;
        if line.trim().is_empty() {
            continue;
        }
        lines_checked += 1;
        let line_number = index + 1;

        let broken = match serde_json::from_str::<ChainedAuditLine>(&line) {
            Ok(parsed) => {
                let entry_json = serde_json::to_string(&parsed.entry)?;
                let expected = chain_hash(previous_hash.as_deref(), &entry_json);
                let linked = parsed.prev_hash == previous_hash;
                debug!("Line {} hash: {}", line_number, expected);
                if linked && parsed.hash == expected {
                    previous_hash = Some(expected);
                    false
                } else {
                    true
                }
            }
            Err(_) => true,
        };

        if broken {
            warn!("Audit chain broken at line {}", line_number);
            return Ok(AuditVerification {
                lines_checked,
                first_broken_line: Some(line_number),
                last_hash: previous_hash,
            });
        }
    }

    Ok(AuditVerification {
        lines_checked,
        first_broken_line: None,
        last_hash: previous_hash,
    })
}
