//! Static identity extraction
//!
//! Walks the token stream of every Lua file in a bundle looking for service
//! registrations made through the SDK module. A registration only counts as
//! resolved when its `name` is a single string literal; anything the scanner
//! cannot follow (computed access, aliases escaping, dynamic code loading) turns
//! the whole report ambiguous so the caller escalates to the sandbox.

use crate::analysis::lexer::{tokenize, Token, TokenKind};
use crate::manifest::Artifact;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

/// Module whose members register services
pub const SERVICE_SDK_MODULE: &str = "restate";

/// Members of the SDK module that register a named service
pub const REGISTRATION_FUNCTIONS: &[&str] = &["service", "workflow", "object"];

/// Globals that let code run or reach bindings the scanner cannot see
const DYNAMIC_PRIMITIVES: &[&str] = &[
    "load",
    "loadstring",
    "dofile",
    "loadfile",
    "_ENV",
    "_G",
    "getfenv",
    "setfenv",
    "rawget",
    "rawset",
    "setmetatable",
    "debug",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Every registration uses a literal name
    Resolved,
    /// At least one registration (or SDK use) could not be followed
    Ambiguous,
}

/// One reason the report could not be resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub file: String,
    pub line: usize,
    pub reason: String,
}

/// Outcome of one static pass over a bundle
///
/// `names` is only trustworthy when `confidence` is `Resolved`.
#[derive(Debug, Clone, Serialize)]
pub struct StaticReport {
    /// Literal service names found across the bundle
    pub names: BTreeSet<String>,
    pub confidence: Confidence,
    pub findings: Vec<Finding>,
}

impl StaticReport {
    pub fn is_resolved(&self) -> bool {
        self.confidence == Confidence::Resolved
    }
}

/// Token-level analyzer for Lua bundles
#[derive(Debug, Clone)]
pub struct StaticAnalyzer {
    allowed_modules: Vec<String>,
}

impl StaticAnalyzer {
    pub fn new(allowed_modules: Vec<String>) -> Self {
        Self { allowed_modules }
    }

    fn allows(&self, module: &str) -> bool {
        self.allowed_modules.iter().any(|m| m == module)
    }

    /// Extract the literal service names the bundle declares
    pub fn extract_declared_identity(&self, artifact: &Artifact) -> StaticReport {
        let mut names = BTreeSet::new();
        let mut findings = Vec::new();

        for (path, source) in &artifact.files {
            if !path.ends_with(".lua") {
                continue;
            }

            match tokenize(source) {
                Ok(tokens) => {
                    let mut scan = FileScan::new(self, artifact, path, &tokens);
                    scan.run();
                    names.extend(scan.names);
                    findings.extend(scan.findings);
                }
                Err(e) => findings.push(Finding {
                    file: path.clone(),
                    line: e.line,
                    reason: format!("source could not be tokenized: {}", e.message),
                }),
            }
        }

        let confidence = if findings.is_empty() {
            Confidence::Resolved
        } else {
            Confidence::Ambiguous
        };

        tracing::debug!(
            "🔍 Static analysis: {:?} names={:?} findings={}",
            confidence,
            names,
            findings.len()
        );

        StaticReport {
            names,
            confidence,
            findings,
        }
    }
}

fn is_registration_fn(name: &str) -> bool {
    REGISTRATION_FUNCTIONS.contains(&name)
}

/// Scanner state for a single file
struct FileScan<'a> {
    analyzer: &'a StaticAnalyzer,
    artifact: &'a Artifact,
    file: &'a str,
    tokens: &'a [Token],
    /// Locals bound to the SDK module table
    sdk_aliases: HashSet<String>,
    /// Locals bound directly to a registration function
    fn_aliases: HashSet<String>,
    names: BTreeSet<String>,
    findings: Vec<Finding>,
}

impl<'a> FileScan<'a> {
    fn new(
        analyzer: &'a StaticAnalyzer,
        artifact: &'a Artifact,
        file: &'a str,
        tokens: &'a [Token],
    ) -> Self {
        Self {
            analyzer,
            artifact,
            file,
            tokens,
            sdk_aliases: HashSet::new(),
            fn_aliases: HashSet::new(),
            names: BTreeSet::new(),
            findings: Vec::new(),
        }
    }

    fn at(&self, index: usize) -> Option<&'a Token> {
        self.tokens.get(index)
    }

    fn before(&self, index: usize, distance: usize) -> Option<&'a Token> {
        index.checked_sub(distance).and_then(|i| self.tokens.get(i))
    }

    fn symbol_at(&self, index: usize, symbol: &str) -> bool {
        self.at(index).map_or(false, |t| t.is_symbol(symbol))
    }

    fn push_finding(&mut self, line: usize, reason: impl Into<String>) {
        self.findings.push(Finding {
            file: self.file.to_string(),
            line,
            reason: reason.into(),
        });
    }

    fn run(&mut self) {
        let tokens = self.tokens;
        for (index, token) in tokens.iter().enumerate() {
            let Some(name) = token.name() else {
                continue;
            };

            // Field names (`x.load`, `x:debug`) are not globals
            if matches!(self.before(index, 1), Some(prev) if prev.is_symbol(".") || prev.is_symbol(":"))
            {
                continue;
            }

            if name == "require" {
                self.visit_require(index);
            } else if self.sdk_aliases.contains(name) {
                self.visit_sdk_use(index, name);
            } else if self.fn_aliases.contains(name) {
                self.visit_registration_fn_use(index, name);
            } else if DYNAMIC_PRIMITIVES.contains(&name) && !self.symbol_at(index + 1, "=") {
                self.push_finding(token.line, format!("use of dynamic primitive '{}'", name));
            }
        }
    }

    /// `require "m"` / `require("m")`; returns the module and the last token of the call
    fn literal_require(&self, index: usize) -> Option<(&'a str, usize)> {
        let next = self.at(index + 1)?;
        if let Some(module) = next.string() {
            return Some((module, index + 1));
        }
        if next.is_symbol("(") && self.symbol_at(index + 3, ")") {
            return self.at(index + 2)?.string().map(|module| (module, index + 3));
        }
        None
    }

    fn visit_require(&mut self, index: usize) {
        let line = self.tokens[index].line;
        let Some((module, end)) = self.literal_require(index) else {
            self.push_finding(line, "require with a non-literal module name");
            return;
        };

        if module == SERVICE_SDK_MODULE && self.analyzer.allows(module) {
            self.bind_sdk_result(index, end);
        } else if self.analyzer.allows(module) || self.artifact.module_path(module).is_some() {
            // Inert helpers and bundle files are scanned on their own
        } else {
            self.push_finding(
                line,
                format!("require of module '{}' outside the whitelist and the bundle", module),
            );
        }
    }

    /// Follow what happens to the value of `require("restate")`
    fn bind_sdk_result(&mut self, start: usize, end: usize) {
        let line = self.tokens[start].line;

        if self.symbol_at(end + 1, ".") {
            match self.at(end + 2).and_then(Token::name) {
                Some(member) if is_registration_fn(member) => {
                    if self.is_call_start(end + 3) {
                        self.visit_registration(end + 3);
                    } else if let Some(alias) = self.binding_target(start) {
                        self.fn_aliases.insert(alias);
                    } else {
                        self.push_finding(line, format!("registration function '{}' escapes", member));
                    }
                }
                Some(_) => {}
                None => self.push_finding(line, "malformed member access on SDK module"),
            }
            return;
        }

        if self.symbol_at(end + 1, "[") || self.symbol_at(end + 1, ":") {
            self.push_finding(line, "computed access on SDK module");
            return;
        }

        match self.binding_target(start) {
            Some(alias) => {
                self.sdk_aliases.insert(alias);
            }
            None => self.push_finding(line, "SDK module escapes its binding"),
        }
    }

    /// Name bound by `local NAME = <expr at start>`, if that is the shape
    ///
    /// Globals are visible to every other file of the bundle, which is scanned
    /// with its own alias table, so a global binding counts as an escape.
    fn binding_target(&self, start: usize) -> Option<String> {
        if !self.before(start, 1)?.is_symbol("=") {
            return None;
        }
        let target = self.before(start, 2)?.name()?;
        if !self.before(start, 3)?.is_name("local") {
            return None;
        }
        Some(target.to_string())
    }

    fn is_call_start(&self, index: usize) -> bool {
        self.at(index).map_or(false, |t| {
            t.is_symbol("(") || t.is_symbol("{") || t.string().is_some()
        })
    }

    fn visit_sdk_use(&mut self, index: usize, alias: &str) {
        let line = self.tokens[index].line;
        let next = self.at(index + 1);

        match next.map(|t| &t.kind) {
            Some(TokenKind::Symbol(".")) => match self.at(index + 2).and_then(Token::name) {
                Some(member) if is_registration_fn(member) => {
                    if self.is_call_start(index + 3) {
                        self.visit_registration(index + 3);
                    } else if let Some(fn_alias) = self.binding_target(index) {
                        self.fn_aliases.insert(fn_alias);
                    } else {
                        self.push_finding(line, format!("registration function '{}' escapes", member));
                    }
                }
                Some(_) => {}
                None => self.push_finding(line, "malformed member access on SDK module"),
            },
            Some(TokenKind::Symbol("[")) => {
                self.push_finding(line, format!("computed access on SDK binding '{}'", alias))
            }
            Some(TokenKind::Symbol(":")) => {
                self.push_finding(line, format!("method call on SDK binding '{}'", alias))
            }
            Some(TokenKind::Symbol("=")) => {
                self.push_finding(line, format!("SDK binding '{}' is re-assigned", alias))
            }
            _ => self.push_finding(line, format!("SDK binding '{}' escapes", alias)),
        }
    }

    fn visit_registration_fn_use(&mut self, index: usize, alias: &str) {
        let line = self.tokens[index].line;
        if self.is_call_start(index + 1) {
            self.visit_registration(index + 1);
        } else if self.symbol_at(index + 1, "=") {
            self.push_finding(line, format!("registration alias '{}' is re-assigned", alias));
        } else {
            self.push_finding(line, format!("registration alias '{}' escapes", alias));
        }
    }

    /// `index` points at the first token of the call arguments
    fn visit_registration(&mut self, index: usize) {
        let line = self.tokens[index].line;
        let parenthesised = self.symbol_at(index, "(");

        let open = if self.symbol_at(index, "{") {
            index
        } else if parenthesised && self.symbol_at(index + 1, "{") {
            index + 1
        } else {
            self.push_finding(line, "service definition is not a table constructor");
            return;
        };

        match self.read_definition(open) {
            Ok((name, close)) => {
                if parenthesised && !self.symbol_at(close + 1, ")") {
                    self.push_finding(line, "registration call passes extra arguments");
                } else {
                    self.names.insert(name);
                }
            }
            Err(reason) => self.push_finding(line, reason),
        }
    }

    /// Parse the top level of the table constructor at `open`
    ///
    /// Returns the literal service name and the index of the closing brace.
    fn read_definition(&self, open: usize) -> Result<(String, usize), String> {
        let tokens = self.tokens;
        let mut entries = Vec::new();
        let mut depth = 0usize;
        let mut entry_start = open + 1;
        let mut close = None;

        for (index, token) in tokens.iter().enumerate().skip(open + 1) {
            match &token.kind {
                TokenKind::Symbol("(" | "{" | "[") => depth += 1,
                TokenKind::Symbol("}") if depth == 0 => {
                    entries.push(entry_start..index);
                    close = Some(index);
                    break;
                }
                TokenKind::Symbol(")" | "}" | "]") => depth = depth.saturating_sub(1),
                TokenKind::Symbol("," | ";") if depth == 0 => {
                    entries.push(entry_start..index);
                    entry_start = index + 1;
                }
                _ => {}
            }
        }

        let close = close.ok_or_else(|| "unterminated service definition".to_string())?;

        let mut keys = HashSet::new();
        let mut service_name = None;
        for entry in entries.into_iter().filter(|range| !range.is_empty()) {
            let first = &tokens[entry.start];
            if first.is_symbol("[") {
                return Err("computed key in service definition".into());
            }
            if first.is_symbol("...") {
                return Err("vararg expansion in service definition".into());
            }

            let key = match (first.name(), tokens.get(entry.start + 1)) {
                (Some(key), Some(eq)) if eq.is_symbol("=") => key,
                _ => return Err("positional entry in service definition".into()),
            };
            if !keys.insert(key) {
                return Err(format!("duplicate key '{}' in service definition", key));
            }

            if key == "name" {
                let value = &tokens[entry.start + 2..entry.end];
                match value {
                    [literal] if literal.string().is_some() => {
                        service_name = literal.string().map(str::to_string);
                    }
                    _ => return Err("service name is not a string literal".into()),
                }
            }
        }

        service_name
            .map(|name| (name, close))
            .ok_or_else(|| "service definition has no name field".to_string())
    }
}
