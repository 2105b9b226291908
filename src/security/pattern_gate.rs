use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

/// Intent patterns matched against request path and query string.
/// Kept as data so the catalogue can grow without touching the matcher.
pub const MALICIOUS_PATTERNS: &[&str] = &[
    // Admin/RDP attempts
    r"/(admin|administrator|rdp|remote|desktop)",
    r"/mstsc",
    r"/(login|signin|auth)\.php",
    // Wiki/CMS
    r"/(wiki|mediawiki|wordpress|wp-admin|wp-login)",
    r"/phpmyadmin",
    // Common exploit paths
    r"/\.env",
    r"/config\.(php|json|yml|yaml)",
    r"/(backup|backups|dump|sql)",
    r"/\.(git|svn|hg)/",
    // Directory traversal
    r"\.\.",
    r"%2e%2e",
    r"//+",
    // Script injection
    r"<script",
    r"javascript:",
    r"vbscript:",
    r"(eval|exec|system)\(",
    // SQL injection
    r"(union|select|insert|update|delete|drop)\s+(all\s+)?(select|from|where)",
    r"(\||&|;|`|\$\()",
    // File inclusion
    r"/(etc/passwd|proc/version|windows/system32)",
    r"\.(php|asp|jsp|py|pl|cgi)\?",
    // Crawler probes
    r"/(robots\.txt|sitemap\.xml)$",
    r"/\.(well-known|htaccess|htpasswd)",
    // Vulnerability scanners
    r"/(wp-content|wp-includes|drupal|joomla)",
    r"/(cgi-bin|bin/sh|usr/bin)",
    // Network probes
    r"/(soap|xmlrpc|rpc2|rpc)",
    r"/(api/v[0-9]+/)?(user|users|admin|login|auth|token)",
];

/// Known scanner and bare automation user agents.
pub const SCANNER_USER_AGENTS: &[&str] = &[
    r"(sqlmap|nikto|nmap|masscan|zmap)",
    r"(gobuster|dirb|dirbuster|wfuzz)",
    r"(burp|owasp|zaproxy)",
    r"(python-requests/|curl/|wget/)",
];

/// Paths the service actually serves; these skip pattern evaluation
/// (they are still rate limited).
pub const ALLOWED_PATHS: &[&str] = &["/", "/api/chat", "/api/health", "/api/models", "/favicon.ico"];

// Compile regexes once at startup
static PATH_REGEXES: Lazy<Vec<Regex>> = Lazy::new(|| compile(MALICIOUS_PATTERNS));
static AGENT_REGEXES: Lazy<Vec<Regex>> = Lazy::new(|| compile(SCANNER_USER_AGENTS));

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match RegexBuilder::new(p).case_insensitive(true).build() {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!(pattern = %p, error = %e, "skipping uncompilable pattern");
                None
            }
        })
        .collect()
}

/// Which part of the request tripped the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTarget {
    Path,
    Query,
    UserAgent,
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResult {
    pub is_malicious: bool,
    pub reason: String,
    pub target: Option<MatchTarget>,
}

impl GateResult {
    pub fn clean() -> Self {
        Self {
            is_malicious: false,
            reason: String::new(),
            target: None,
        }
    }

    pub fn blocked(reason: String, target: MatchTarget) -> Self {
        Self {
            is_malicious: true,
            reason,
            target: Some(target),
        }
    }
}

/// Stateless matcher of request path, query and user agent against the
/// malicious-intent catalogue. First match wins.
#[derive(Clone)]
pub struct PatternGate {
    path_patterns: &'static [Regex],
    agent_patterns: &'static [Regex],
}

impl PatternGate {
    pub fn new() -> Self {
        Self {
            path_patterns: PATH_REGEXES.as_slice(),
            agent_patterns: AGENT_REGEXES.as_slice(),
        }
    }

    /// Whether the path is on the allow-list and bypasses `evaluate`.
    pub fn is_allowed_path(&self, path: &str) -> bool {
        ALLOWED_PATHS.contains(&path)
    }

    /// Check a request against the catalogue.
    ///
    /// # Arguments
    /// * `path` - Request path without the query string
    /// * `user_agent` - Raw `User-Agent` header, empty when absent
    /// * `query` - Raw query string, empty when absent
    pub fn evaluate(&self, path: &str, user_agent: &str, query: &str) -> GateResult {
        if self.path_patterns.iter().any(|re| re.is_match(path)) {
            return GateResult::blocked(
                format!("Malicious path pattern detected: {}", path),
                MatchTarget::Path,
            );
        }

        if !query.is_empty() && self.path_patterns.iter().any(|re| re.is_match(query)) {
            return GateResult::blocked(
                format!("Malicious query parameter detected: {}", query),
                MatchTarget::Query,
            );
        }

        if !user_agent.is_empty() && self.agent_patterns.iter().any(|re| re.is_match(user_agent)) {
            return GateResult::blocked(
                format!("Suspicious user agent: {}", user_agent),
                MatchTarget::UserAgent,
            );
        }

        GateResult::clean()
    }

    /// Paths that are let through but still worth a log line.
    pub fn is_suspicious(&self, path: &str) -> bool {
        let lowercase = path.to_lowercase();
        ["admin", "login", "config", "api"]
            .iter()
            .any(|keyword| lowercase.contains(keyword))
    }
}

impl Default for PatternGate {
    fn default() -> Self {
        Self::new()
    }
}
