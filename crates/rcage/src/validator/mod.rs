//! Static screening of submitted R code
//!
//! The validator rejects snippets matching a deny/allow policy before any
//! interpreter sees them. It is a syntactic filter: it catches the obvious
//! idioms for touching the host but cannot prove code harmless.

use std::collections::HashSet;

use regex::Regex;
use tracing::debug;

pub use crate::validator::rules::{
    ALLOWED_PACKAGES, DANGEROUS_FUNCTIONS, DANGEROUS_PACKAGES, RuleCategory,
};

use crate::config::ValidatorConfig;
use crate::validator::rules::{
    RuleKind, attach_pattern, call_pattern, dangerous_attach_pattern, namespace_pattern,
    rule_table,
};

mod rules;

/// A rejected snippet: which rule fired and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub category: RuleCategory,
    pub reason: String,
}

/// Outcome of validating a snippet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Safe,
    Unsafe(Violation),
}

impl Verdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, Verdict::Safe)
    }

    /// Human-readable reason, when unsafe
    pub fn reason(&self) -> Option<&str> {
        match self {
            Verdict::Safe => None,
            Verdict::Unsafe(violation) => Some(&violation.reason),
        }
    }

    /// Rule category, when unsafe
    pub fn category(&self) -> Option<RuleCategory> {
        match self {
            Verdict::Safe => None,
            Verdict::Unsafe(violation) => Some(violation.category),
        }
    }
}

/// A call the deny-list rejects, with the label used in the reason
#[derive(Debug)]
struct DeniedCall {
    label: String,
    regex: Regex,
}

#[derive(Debug)]
enum CompiledCheck {
    DeniedCalls,
    Pattern(Regex),
    PackageAccess,
}

#[derive(Debug)]
struct CompiledRule {
    category: RuleCategory,
    check: CompiledCheck,
}

/// Compiled validation policy
///
/// Construction compiles every rule once; [`validate`](Self::validate) is
/// then pure and can be shared across tasks.
#[derive(Debug)]
pub struct CodeValidator {
    max_code_length: usize,
    rules: Vec<CompiledRule>,
    denied_calls: Vec<DeniedCall>,
    allowed_packages: HashSet<String>,
    attach: Regex,
    namespace: Regex,
}

impl CodeValidator {
    /// Build a validator from configuration
    pub fn new(config: &ValidatorConfig) -> Self {
        let rules = rule_table()
            .into_iter()
            .map(|spec| CompiledRule {
                category: spec.category,
                check: match spec.kind {
                    RuleKind::DeniedCalls => CompiledCheck::DeniedCalls,
                    RuleKind::Pattern(pattern) => CompiledCheck::Pattern(compile(&pattern)),
                    RuleKind::PackageAccess => CompiledCheck::PackageAccess,
                },
            })
            .collect();

        let mut denied_calls: Vec<DeniedCall> = DANGEROUS_FUNCTIONS
            .iter()
            .copied()
            .chain(config.extra_denied_functions.iter().map(String::as_str))
            .map(|name| DeniedCall {
                label: name.to_owned(),
                regex: compile(&call_pattern(name.trim())),
            })
            .collect();
        denied_calls.extend(DANGEROUS_PACKAGES.iter().map(|package| DeniedCall {
            label: format!("library({package})"),
            regex: compile(&dangerous_attach_pattern(package)),
        }));

        let allowed_packages = ALLOWED_PACKAGES
            .iter()
            .map(|p| (*p).to_owned())
            .chain(config.extra_allowed_packages.iter().cloned())
            .collect();

        Self {
            max_code_length: config.max_code_length,
            rules,
            denied_calls,
            allowed_packages,
            attach: compile(&attach_pattern()),
            namespace: compile(&namespace_pattern()),
        }
    }

    /// Check code against the policy. The first violated rule wins.
    pub fn validate(&self, code: &str) -> Verdict {
        if code.chars().count() > self.max_code_length {
            return self.reject(RuleCategory::Length, None);
        }

        for rule in &self.rules {
            let detail = match &rule.check {
                CompiledCheck::DeniedCalls => self
                    .denied_calls
                    .iter()
                    .find(|call| call.regex.is_match(code))
                    .map(|call| format!("Dangerous function detected: {}", call.label)),
                CompiledCheck::Pattern(regex) => regex.is_match(code).then(String::new),
                CompiledCheck::PackageAccess => self
                    .disallowed_package(code)
                    .map(|package| format!("Package '{package}' is not allowed")),
            };

            if let Some(detail) = detail {
                let reason = (!detail.is_empty()).then_some(detail);
                return self.reject(rule.category, reason);
            }
        }

        Verdict::Safe
    }

    /// Check if a package may be attached
    pub fn is_package_allowed(&self, package: &str) -> bool {
        self.allowed_packages.contains(package)
    }

    fn disallowed_package<'a>(&self, code: &'a str) -> Option<&'a str> {
        self.attach
            .captures_iter(code)
            .chain(self.namespace.captures_iter(code))
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .find(|package| !self.is_package_allowed(package))
    }

    fn reject(&self, category: RuleCategory, reason: Option<String>) -> Verdict {
        let reason = reason
            .or_else(|| category.reason().map(str::to_owned))
            .unwrap_or_else(|| format!("{category:?}"));
        debug!(?category, %reason, "code rejected");
        Verdict::Unsafe(Violation { category, reason })
    }
}

impl Default for CodeValidator {
    fn default() -> Self {
        Self::new(&ValidatorConfig::default())
    }
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in rule pattern must compile")
}
