//! Static validation of generated plotting scripts.
//!
//! Two passes run before anything is executed:
//!
//! 1. [`lexical_scan`] - a cheap, case-insensitive denylist over the raw text.
//! 2. [`StaticValidator::structural_scan`] - parses the script into a Python
//!    syntax tree and enforces an import allowlist plus a ban on
//!    process-execution and dynamic-evaluation calls.
//!
//! Neither pass is a safety proof. The container is the actual boundary; the
//! validator only shrinks what can reach it.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use rustpython_ast::Visitor;
use rustpython_parser::{ast, lexer::lex, Mode, Parse, Tok};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Closed set of reasons a script can be rejected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    DeniedKeyword,
    DisallowedImport,
    DangerousCall,
    SyntaxError,
}

impl Violation {
    pub fn code(&self) -> &'static str {
        match self {
            Violation::DeniedKeyword => "denied_keyword",
            Violation::DisallowedImport => "disallowed_import",
            Violation::DangerousCall => "dangerous_call",
            Violation::SyntaxError => "syntax_error",
        }
    }
}

/// A rejection with an internal-only detail string (never shown to callers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: Violation,
    pub detail: String,
}

impl Rejection {
    fn new(reason: Violation, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Accepted,
    Rejected(Rejection),
}

impl ValidationVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted)
    }

    pub fn violation(&self) -> Option<Violation> {
        match self {
            ValidationVerdict::Accepted => None,
            ValidationVerdict::Rejected(r) => Some(r.reason),
        }
    }
}

impl From<Result<(), Rejection>> for ValidationVerdict {
    fn from(result: Result<(), Rejection>) -> Self {
        match result {
            Ok(()) => ValidationVerdict::Accepted,
            Err(rejection) => ValidationVerdict::Rejected(rejection),
        }
    }
}

/// Denylisted tokens: (pattern, label used in diagnostics)
const DENYLIST: &[(&str, &str)] = &[
    (r"\bsubprocess\.", "subprocess."),
    (r"\beval\b", "eval"),
    (r"\bexec\b", "exec"),
    (r"\bexecfile\b", "execfile"),
    (r"\bcompile\b", "compile"),
    (r"\brm\b", "rm"),
    (r"\brmtree\b", "rmtree"),
    (r"\brmdir\b", "rmdir"),
    (r"\bunlink\b", "unlink"),
    (r"\bdelete\b", "delete"),
    (r"\bimport\s+sys\b", "import sys"),
    (r"\bopen\s*\(", "open("),
    (r"\bshutil\.", "shutil."),
    (r"\bpty\.", "pty."),
    (r"\binput\s*\(", "input("),
];

static DENYLIST_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    DENYLIST
        .iter()
        .map(|(pattern, label)| {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("denylist patterns are valid");
            (regex, *label)
        })
        .collect()
});

/// Modules generated code may import
pub const ALLOWED_MODULES: &[&str] = &["numpy", "pandas", "matplotlib.pyplot", "seaborn", "os"];

/// Attribute names that spawn or replace processes (`os.system`, `subprocess.run`, ...)
const PROCESS_EXEC_NAMES: &[&str] = &[
    "system",
    "popen",
    "Popen",
    "run",
    "call",
    "check_call",
    "check_output",
    "getoutput",
    "getstatusoutput",
    "spawnl",
    "spawnle",
    "spawnlp",
    "spawnlpe",
    "spawnv",
    "spawnve",
    "spawnvp",
    "spawnvpe",
    "posix_spawn",
    "posix_spawnp",
    "execl",
    "execle",
    "execlp",
    "execlpe",
    "execv",
    "execve",
    "execvp",
    "execvpe",
    "fork",
    "forkpty",
    "startfile",
];

/// Bare builtins that evaluate or compile code at runtime
const DYNAMIC_EVAL_NAMES: &[&str] = &["eval", "exec", "execfile", "compile", "__import__"];

const MAX_SCRIPT_BYTES: usize = 32 * 1024;
const MAX_BRACKET_DEPTH: usize = 100;
const VALIDATOR_STACK_BYTES: usize = 64 * 1024 * 1024;

/// Denylist pass over raw text. Also used to screen prompts before generation.
pub fn lexical_scan(text: &str) -> Result<(), Rejection> {
    for (regex, label) in DENYLIST_PATTERNS.iter() {
        if regex.is_match(text) {
            return Err(Rejection::new(
                Violation::DeniedKeyword,
                format!("denied token `{label}`"),
            ));
        }
    }
    Ok(())
}

/// One import statement. `names` is empty for `import module`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub module: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallTarget {
    /// `name(...)`
    Name(String),
    /// `<expr>.attr(...)`
    Attribute(String),
}

/// Facts derived from a parsed script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptFacts {
    pub imports: Vec<ImportRecord>,
    pub call_targets: BTreeSet<CallTarget>,
}

impl ScriptFacts {
    /// Declared import set
    pub fn modules(&self) -> BTreeSet<&str> {
        self.imports.iter().map(|i| i.module.as_str()).collect()
    }
}

/// Untrusted generated source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    source: String,
}

impl Script {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Parse and derive the import and call-target sets.
    ///
    /// Parsing runs on a dedicated thread with a large stack so that
    /// pathological nesting can neither overflow the caller's stack nor
    /// unwind into it; any failure is reported as a `SyntaxError` rejection.
    pub fn facts(&self) -> Result<ScriptFacts, Rejection> {
        if self.source.trim().is_empty() {
            return Err(Rejection::new(Violation::SyntaxError, "empty script"));
        }
        if self.source.len() > MAX_SCRIPT_BYTES {
            return Err(Rejection::new(
                Violation::SyntaxError,
                format!("script exceeds {MAX_SCRIPT_BYTES} bytes"),
            ));
        }
        if bracket_depth(&self.source) > MAX_BRACKET_DEPTH {
            return Err(Rejection::new(
                Violation::SyntaxError,
                "bracket nesting too deep",
            ));
        }

        let source = self.source.clone();
        let handle = std::thread::Builder::new()
            .name("plotbox-validator".to_string())
            .stack_size(VALIDATOR_STACK_BYTES)
            .spawn(move || collect_facts(&source))
            .map_err(|e| {
                Rejection::new(
                    Violation::SyntaxError,
                    format!("analysis thread failed to start: {e}"),
                )
            })?;

        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(Rejection::new(
                Violation::SyntaxError,
                "parser panicked during analysis",
            )),
        }
    }
}

/// Nesting depth of bracket tokens. Brackets inside strings and comments
/// are not tokens and do not count; a lexical error ends the count and is
/// left for the parser to report.
fn bracket_depth(source: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    for token in lex(source, Mode::Module) {
        let Ok((tok, _)) = token else {
            break;
        };
        match tok {
            Tok::Lpar | Tok::Lsqb | Tok::Lbrace => {
                depth += 1;
                max = max.max(depth);
            }
            Tok::Rpar | Tok::Rsqb | Tok::Rbrace => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

fn collect_facts(source: &str) -> Result<ScriptFacts, Rejection> {
    let suite = ast::Suite::parse(source, "<script>")
        .map_err(|e| Rejection::new(Violation::SyntaxError, e.to_string()))?;

    let mut collector = FactCollector::default();
    for stmt in suite {
        collector.visit_stmt(stmt);
    }
    Ok(collector.facts)
}

#[derive(Default)]
struct FactCollector {
    facts: ScriptFacts,
}

impl Visitor for FactCollector {
    fn visit_stmt_import(&mut self, node: ast::StmtImport) {
        for alias in node.names {
            self.facts.imports.push(ImportRecord {
                module: alias.name.as_str().to_owned(),
                names: Vec::new(),
            });
        }
    }

    fn visit_stmt_import_from(&mut self, node: ast::StmtImportFrom) {
        // Relative imports keep their leading dots so they never match the allowlist
        let level = node.level.map_or(0, |l| l.to_u32()) as usize;
        let module = node.module.as_ref().map_or("", |m| m.as_str());
        self.facts.imports.push(ImportRecord {
            module: format!("{}{}", ".".repeat(level), module),
            names: node
                .names
                .iter()
                .map(|alias| alias.name.as_str().to_owned())
                .collect(),
        });
    }

    fn visit_expr_call(&mut self, node: ast::ExprCall) {
        match node.func.as_ref() {
            ast::Expr::Name(name) => {
                self.facts
                    .call_targets
                    .insert(CallTarget::Name(name.id.as_str().to_owned()));
            }
            ast::Expr::Attribute(attr) => {
                self.facts
                    .call_targets
                    .insert(CallTarget::Attribute(attr.attr.as_str().to_owned()));
            }
            _ => {}
        }
        self.generic_visit_expr_call(node);
    }
}

/// Validator holding the fixed import allowlist
#[derive(Debug, Clone)]
pub struct StaticValidator {
    allowed_modules: BTreeSet<String>,
}

impl Default for StaticValidator {
    fn default() -> Self {
        Self {
            allowed_modules: ALLOWED_MODULES.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl StaticValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run both passes. Dataset presence is only recorded for diagnostics.
    pub fn validate(&self, script: &Script, declared_dataset_present: bool) -> ValidationVerdict {
        let verdict: ValidationVerdict = lexical_scan(script.as_str())
            .and_then(|()| self.structural_scan(script).map(|_| ()))
            .into();

        match &verdict {
            ValidationVerdict::Accepted => debug!(
                dataset = declared_dataset_present,
                "[VALIDATOR] Script accepted ({} bytes)",
                script.as_str().len()
            ),
            ValidationVerdict::Rejected(r) => warn!(
                dataset = declared_dataset_present,
                "[VALIDATOR] Script rejected: {} ({})",
                r.reason.code(),
                r.detail
            ),
        }
        verdict
    }

    /// Denylist-only screening of the user's prompt before generation.
    pub fn screen_prompt(&self, prompt: &str) -> ValidationVerdict {
        let verdict: ValidationVerdict = lexical_scan(prompt).into();
        if let ValidationVerdict::Rejected(r) = &verdict {
            warn!("[VALIDATOR] Prompt rejected: {}", r.detail);
        }
        verdict
    }

    /// Syntax-tree pass: import allowlist, then call bans.
    pub fn structural_scan(&self, script: &Script) -> Result<ScriptFacts, Rejection> {
        let facts = script.facts()?;
        self.check_imports(&facts)?;
        check_calls(&facts)?;
        Ok(facts)
    }

    /// `pandas` allows `pandas` and `pandas.plotting`, not `pandasx`
    pub fn module_allowed(&self, module: &str) -> bool {
        self.allowed_modules.iter().any(|allowed| {
            module == allowed
                || (module.len() > allowed.len()
                    && module.starts_with(allowed.as_str())
                    && module.as_bytes()[allowed.len()] == b'.')
        })
    }

    fn check_imports(&self, facts: &ScriptFacts) -> Result<(), Rejection> {
        for import in &facts.imports {
            if import.names.iter().any(|n| n == "*") {
                return Err(Rejection::new(
                    Violation::DisallowedImport,
                    format!("wildcard import from `{}`", import.module),
                ));
            }

            let allowed = self.module_allowed(&import.module)
                || (!import.names.is_empty()
                    && import
                        .names
                        .iter()
                        .all(|n| self.module_allowed(&format!("{}.{}", import.module, n))));
            if !allowed {
                return Err(Rejection::new(
                    Violation::DisallowedImport,
                    format!("module `{}` is not in the allowlist", import.module),
                ));
            }

            // `from os import system` would otherwise hide the call behind a bare name
            if let Some(name) = import
                .names
                .iter()
                .find(|n| is_process_exec(n) || DYNAMIC_EVAL_NAMES.contains(&n.as_str()))
            {
                return Err(Rejection::new(
                    Violation::DangerousCall,
                    format!("imports `{name}` from `{}`", import.module),
                ));
            }
        }
        Ok(())
    }
}

fn is_process_exec(name: &str) -> bool {
    PROCESS_EXEC_NAMES.contains(&name)
}

fn check_calls(facts: &ScriptFacts) -> Result<(), Rejection> {
    for target in &facts.call_targets {
        let dangerous = match target {
            CallTarget::Attribute(attr) => is_process_exec(attr),
            CallTarget::Name(name) => DYNAMIC_EVAL_NAMES.contains(&name.as_str()),
        };
        if dangerous {
            return Err(Rejection::new(
                Violation::DangerousCall,
                format!("call to {target:?}"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(code: &str) -> Option<Violation> {
        StaticValidator::new()
            .validate(&Script::new(code), true)
            .violation()
    }

    const TYPICAL_PLOT: &str = r#"
import pandas as pd
import numpy as np
import matplotlib.pyplot as plt
import seaborn as sns
import os

df = pd.read_csv(data_path)
df["total"] = np.cumsum(df["sales"])
fig, ax = plt.subplots(figsize=(8, 5))
sns.barplot(data=df, x="region", y="total", ax=ax)
ax.set_title("Sales by region")
plt.tight_layout()
plt.savefig(os.path.join(os.path.dirname(output_path), "plot.png"))
"#;

    #[test]
    fn test_typical_plot_accepted() {
        assert_eq!(verdict(TYPICAL_PLOT), None);
    }

    #[test]
    fn test_plot_without_imports_accepted() {
        assert_eq!(verdict("df.plot(); plt.savefig(output_path)"), None);
    }

    #[test]
    fn test_every_denylisted_token_rejected() {
        let samples = [
            "subprocess.Popen(['ls'])",
            "x = eval('1+1')",
            "exec('print(1)')",
            "execfile('a.py')",
            "code = compile('1', 'f', 'eval')",
            "# rm -rf /",
            "shutil_like.rmtree(path)",
            "os.rmdir(path)",
            "os.unlink(path)",
            "delete everything",
            "import sys",
            "f = open('/etc/passwd')",
            "shutil.copy(a, b)",
            "pty.spawn('/bin/sh')",
            "name = input('?')",
        ];
        for sample in samples {
            assert_eq!(
                verdict(sample),
                Some(Violation::DeniedKeyword),
                "sample should be denied: {sample}"
            );
        }
    }

    #[test]
    fn test_denylist_is_case_insensitive_and_whole_word() {
        assert_eq!(verdict("EVAL('1')"), Some(Violation::DeniedKeyword));
        assert_eq!(verdict("Import  Sys"), Some(Violation::DeniedKeyword));
        // Substrings of longer identifiers are not whole-word matches
        assert_eq!(verdict("evaluation = 1\nfirm = 2\nplt.savefig(output_path)"), None);
        assert_eq!(verdict("import numpy\nimport os\nsystem_load = 3"), None);
    }

    #[test]
    fn test_disallowed_imports_rejected() {
        for code in [
            "import socket\nsocket.socket()",
            "import requests",
            "from urllib import request",
            "import matplotlib",
            "import pandasx",
            "from . import helpers",
            "from numpy import *",
            "import numpy, ctypes",
        ] {
            assert_eq!(
                verdict(code),
                Some(Violation::DisallowedImport),
                "should be a disallowed import: {code}"
            );
        }
    }

    #[test]
    fn test_allowed_import_forms() {
        for code in [
            "import matplotlib.pyplot as plt",
            "from matplotlib import pyplot as plt",
            "from pandas.plotting import scatter_matrix",
            "import os.path",
            "from os import path",
            "import numpy as np, seaborn as sns",
        ] {
            assert_eq!(verdict(code), None, "should be allowed: {code}");
        }
    }

    #[test]
    fn test_process_exec_calls_rejected() {
        assert_eq!(
            verdict("import os\nos.system('ls')"),
            Some(Violation::DangerousCall)
        );
        assert_eq!(
            verdict("import os\nos.popen('id').read()"),
            Some(Violation::DangerousCall)
        );
        // Found through arguments and nested scopes
        assert_eq!(
            verdict("import os\ndef f():\n    print(os.execvp('sh', ['sh']))\n"),
            Some(Violation::DangerousCall)
        );
        // Aliasing the module does not hide the attribute
        assert_eq!(
            verdict("import os as o\no.system('ls')"),
            Some(Violation::DangerousCall)
        );
        assert_eq!(
            verdict("from os import system\nsystem('ls')"),
            Some(Violation::DangerousCall)
        );
    }

    #[test]
    fn test_dynamic_eval_names_rejected_by_structural_pass() {
        let validator = StaticValidator::new();
        for code in ["eval('1')", "exec('x = 1')", "__import__('socket')"] {
            let err = validator.structural_scan(&Script::new(code)).unwrap_err();
            assert_eq!(err.reason, Violation::DangerousCall, "{code}");
        }
        // Not caught lexically, still rejected
        assert_eq!(verdict("__import__('socket')"), Some(Violation::DangerousCall));
    }

    #[test]
    fn test_syntax_errors_rejected() {
        assert_eq!(verdict("def broken(:\n    pass"), Some(Violation::SyntaxError));
        assert_eq!(verdict("   \n"), Some(Violation::SyntaxError));
        let deep = format!("x = {}1{}", "(".repeat(500), ")".repeat(500));
        assert_eq!(verdict(&deep), Some(Violation::SyntaxError));
    }

    #[test]
    fn test_brackets_in_strings_and_comments_do_not_count_as_nesting() {
        let title = format!(
            "plt.plot([1, 2])\nplt.title('{}')  # {}\nplt.savefig(output_path)",
            "(".repeat(150),
            "[".repeat(150)
        );
        assert_eq!(verdict(&title), None);
        assert_eq!(bracket_depth(&title), 2);
    }

    #[test]
    fn test_facts_collect_imports_and_calls() {
        let facts = Script::new(TYPICAL_PLOT).facts().unwrap();
        let modules = facts.modules();
        assert!(modules.contains("matplotlib.pyplot"));
        assert!(modules.contains("seaborn"));
        assert!(facts
            .call_targets
            .contains(&CallTarget::Attribute("savefig".to_string())));
        assert!(facts
            .call_targets
            .contains(&CallTarget::Attribute("read_csv".to_string())));
    }

    #[test]
    fn test_relative_import_keeps_dots() {
        let facts = Script::new("from ..pkg import thing").facts().unwrap();
        assert_eq!(facts.imports[0].module, "..pkg");
    }

    #[test]
    fn test_module_allowed_prefix_rules() {
        let validator = StaticValidator::new();
        assert!(validator.module_allowed("pandas"));
        assert!(validator.module_allowed("pandas.plotting"));
        assert!(validator.module_allowed("matplotlib.pyplot"));
        assert!(!validator.module_allowed("matplotlib"));
        assert!(!validator.module_allowed("osx"));
        assert!(!validator.module_allowed(""));
    }

    #[test]
    fn test_prompt_screening() {
        let validator = StaticValidator::new();
        assert!(validator
            .screen_prompt("Plot monthly revenue as a line chart")
            .is_accepted());
        assert_eq!(
            validator
                .screen_prompt("plot it, then delete the input file")
                .violation(),
            Some(Violation::DeniedKeyword)
        );
    }
}
