//! Rule table for static code validation
//!
//! Rules are evaluated in table order; the first match wins.

use serde::Serialize;

/// Characters that may continue an R identifier
pub(crate) const IDENT_BOUNDARY: &str = r"(?:^|[^A-Za-z0-9._])";

/// Functions rejected when called directly
pub const DANGEROUS_FUNCTIONS: &[&str] = &[
    // OS processes and environment
    "system",
    "system2",
    "shell",
    "shell.exec",
    "Sys.setenv",
    "Sys.unsetenv",
    "setwd",
    "getwd",
    "dyn.load",
    // File mutation
    "file.remove",
    "unlink",
    "file.rename",
    // Network and package installation
    "download.file",
    "install.packages",
    // Re-entry into the interpreter
    "source",
    "sys.source",
    "eval",
    "evalq",
    "parse",
    "str2lang",
    "str2expression",
    // Serialization
    "save",
    "save.image",
    "saveRDS",
    "load",
    "readRDS",
    "unserialize",
    // Process termination
    "q",
    "quit",
    // Parallelism and forking
    "mclapply",
    "mcparallel",
    "parLapply",
    "clusterApply",
    "makeCluster",
];

/// Packages whose attachment is rejected outright
pub const DANGEROUS_PACKAGES: &[&str] = &["parallel", "foreach"];

/// Packages code may attach or reference through `pkg::`
pub const ALLOWED_PACKAGES: &[&str] = &[
    "ggplot2",
    "dplyr",
    "tidyr",
    "readr",
    "corrplot",
    "plotly",
    "lattice",
    "stats",
    "graphics",
    "grDevices",
    "utils",
    "methods",
    "base",
    "scales",
    "viridis",
    "RColorBrewer",
    "gridExtra",
    "patchwork",
    "forecast",
    "tseries",
    "xts",
    "caret",
    "randomForest",
    "e1071",
    "cluster",
    "factoextra",
    "igraph",
    "network",
    "leaflet",
    "sf",
    "sp",
    "base64enc",
];

/// What kind of policy a rejected snippet violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Length,
    DangerousFunction,
    FileSystem,
    Network,
    Backtick,
    SystemCommand,
    Package,
    InfiniteLoop,
    LargeSequence,
}

impl RuleCategory {
    /// Fixed reason text, for categories whose message carries no detail
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Length => Some("Code exceeds maximum allowed length"),
            Self::FileSystem => Some("File system access is not allowed"),
            Self::Network => Some("Network access is not allowed"),
            Self::Backtick => Some("Backtick command execution is not allowed"),
            Self::SystemCommand => Some("System command execution is not allowed"),
            Self::InfiniteLoop => Some("Potentially infinite loops are not allowed"),
            Self::LargeSequence => Some("Generation of very large sequences is not allowed"),
            Self::DangerousFunction | Self::Package => None,
        }
    }
}

/// How a rule inspects the source
#[derive(Debug, Clone)]
pub(crate) enum RuleKind {
    /// Any deny-listed call
    DeniedCalls,
    /// A plain regular expression
    Pattern(String),
    /// Attached or namespace-referenced packages outside the allow-list
    PackageAccess,
}

#[derive(Debug, Clone)]
pub(crate) struct RuleSpec {
    pub category: RuleCategory,
    pub kind: RuleKind,
}

fn pattern(category: RuleCategory, pattern: impl Into<String>) -> RuleSpec {
    RuleSpec {
        category,
        kind: RuleKind::Pattern(pattern.into()),
    }
}

/// Large literal: 1e6 and up in scientific notation, or seven or more digits
const LARGE_LITERAL: &str = r"(?:\d(?:\.\d+)?[eE]\+?(?:[6-9]|[1-9]\d+)|\d{7,})";

/// Ordered rule table. The length ceiling is checked before any of these.
pub(crate) fn rule_table() -> Vec<RuleSpec> {
    use RuleCategory::*;

    vec![
        RuleSpec {
            category: DangerousFunction,
            kind: RuleKind::DeniedCalls,
        },
        pattern(FileSystem, r"(?i)file\s*\.\s*(?:create|remove|rename|copy|exists|info)"),
        pattern(FileSystem, r"(?i)dir\s*\.\s*(?:create|exists)"),
        pattern(FileSystem, r"(?i)read\s*\.\s*(?:csv|table|delim|xlsx|json)"),
        pattern(FileSystem, r"(?i)write\s*\.\s*(?:csv|table|xlsx|json)"),
        pattern(FileSystem, r"(?i)list\s*\.\s*(?:files|dirs)\s*\("),
        pattern(FileSystem, r"(?i)(?:^|[^A-Za-z0-9._])readLines\s*\("),
        pattern(FileSystem, r"(?i)(?:^|[^A-Za-z0-9._])(?:gz|bz|xz)?file\s*\("),
        pattern(FileSystem, r"(?i)(?:^|[^A-Za-z0-9._])fifo\s*\("),
        pattern(FileSystem, r"(?i)scan\s*\("),
        pattern(FileSystem, r"(?i)sink\s*\("),
        pattern(FileSystem, r"(?i)connection\s*\("),
        pattern(Network, r"(?i)(?:^|[^A-Za-z0-9._])url\s*\("),
        pattern(Network, r"(?i)download\s*\.\s*file"),
        pattern(Network, r"(?i)httr::"),
        pattern(Network, r"(?i)RCurl::"),
        pattern(Network, r"(?i)curl::"),
        pattern(Network, r"(?i)(?:make\.socket|socketAccept|serverSocket)\s*\("),
        pattern(Network, r"(?i)(?:https?|ftp)://"),
        pattern(Backtick, r"`[^`]+`"),
        pattern(SystemCommand, r"system\s*\(|shell\s*\(|pipe\s*\("),
        RuleSpec {
            category: Package,
            kind: RuleKind::PackageAccess,
        },
        pattern(InfiniteLoop, r"while\s*\(\s*(?:TRUE|T|1)\s*\)"),
        pattern(InfiniteLoop, r"repeat\s*\{"),
        pattern(LargeSequence, large_sequence_pattern()),
    ]
}

/// Pattern for sequence-construction calls with a huge literal argument,
/// or `:` ranges with a huge bound
fn large_sequence_pattern() -> String {
    format!(
        r"{IDENT_BOUNDARY}(?:seq|seq_len|seq\.int|rep|rep_len)\s*\([^)]*{LARGE_LITERAL}|{LARGE_LITERAL}\s*:[^:]|[^:]:\s*{LARGE_LITERAL}"
    )
}

/// Pattern for `library(...)`-style attachment; group 1 is the package name
pub(crate) fn attach_pattern() -> String {
    format!(
        r#"{IDENT_BOUNDARY}(?:library|require|requireNamespace|loadNamespace)\s*\(\s*["']?([A-Za-z][A-Za-z0-9._]*)"#
    )
}

/// Pattern for `pkg::name` and `pkg:::name`; group 1 is the package name
pub(crate) fn namespace_pattern() -> String {
    format!(r"{IDENT_BOUNDARY}([A-Za-z][A-Za-z0-9._]*):::?")
}

/// Pattern for a direct call of `name`
pub(crate) fn call_pattern(name: &str) -> String {
    format!(r"(?i){IDENT_BOUNDARY}{}\s*\(", regex::escape(name))
}

/// Pattern for attaching a deny-listed package
pub(crate) fn dangerous_attach_pattern(package: &str) -> String {
    format!(
        r#"(?i){IDENT_BOUNDARY}(?:library|require)\s*\(\s*["']?{}["']?\s*\)"#,
        regex::escape(package)
    )
}
