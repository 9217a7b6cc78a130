//! Wrapping user code for a session round-trip

use uuid::Uuid;

use crate::dataset::escape_r_string;
use crate::types::ERROR_PREFIX;

/// Per-call completion marker printed after the user code finishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMarker(String);

impl CompletionMarker {
    /// Mint a fresh marker from a random UUID
    pub fn new() -> Self {
        Self(format!("<<RCAGE_DONE_{}>>", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Default for CompletionMarker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CompletionMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the program text sent to the interpreter for one call.
///
/// The code travels as a string literal and is parsed inside the handler,
/// so syntax errors are reported like runtime errors and nothing the user
/// writes can close the handler early. Visible values print as at the REPL.
pub fn wrap_code(code: &str, marker: &CompletionMarker) -> String {
    format!(
        r#"local({{
  .rcage_code <- "{code}"
  tryCatch({{
    for (.rcage_expr in parse(text = .rcage_code, keep.source = FALSE)) {{
      .rcage_value <- withVisible(eval(.rcage_expr, envir = globalenv()))
      if (.rcage_value$visible) print(.rcage_value$value)
    }}
  }}, error = function(e) cat("{ERROR_PREFIX}", conditionMessage(e), "\n"))
}})
cat("\n{marker}\n")
flush(stdout())
"#,
        code = escape_r_string(code),
    )
}

/// Find `marker` in `haystack`, scanning only bytes that could hold a
/// match ending at or after `from`
pub(crate) fn find_marker(haystack: &[u8], marker: &[u8], from: usize) -> Option<usize> {
    let start = from.saturating_sub(marker.len().saturating_sub(1));
    haystack
        .get(start..)?
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|pos| start + pos)
}
