//! Structural walk over a token stream.
//!
//! Recovers the pieces the rule table needs: imports (with their aliases),
//! function and class definitions, dotted references and calls resolved
//! through import aliases, bare `except:` clauses and hardcoded secrets.
//! Statement-level grammar errors are reported as [`SyntaxError`]s.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use super::lexer::{SyntaxError, Token, TokenKind};

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

const COMPOUND: &[&str] = &[
    "if", "elif", "else", "while", "for", "try", "except", "finally", "with", "def", "class",
    "async",
];

const BRANCHING: &[&str] = &[
    "if", "elif", "while", "for", "try", "except", "with", "assert", "and", "or",
];

fn secret_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)^(?:.*_)?(?:password|passwd|pwd|secret|api_?key|token|private_?key)$")
                .ok()
        })
        .as_ref()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: String,
    pub line: usize,
    /// Indentation depth; 0 is module level.
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    /// Fully qualified module, e.g. `os.path` or `subprocess`.
    pub module: String,
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Dotted target with the head resolved through import aliases.
    pub target: String,
    pub line: usize,
    pub col: usize,
    pub is_call: bool,
    /// Top-level positional arguments of the call, in order.
    pub positional: Vec<ArgValue>,
    /// The `mode=` keyword; `**kwargs` unpacking counts as a dynamic mode.
    pub mode_kwarg: Option<ArgValue>,
}

/// A call argument as far as static analysis can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    /// A lone plain string literal.
    Literal(String),
    /// Anything computed at runtime.
    Dynamic,
}

impl ArgValue {
    pub fn literal(&self) -> Option<&str> {
        match self {
            ArgValue::Literal(value) => Some(value),
            ArgValue::Dynamic => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub line: usize,
    pub col: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Analysis {
    pub functions: Vec<FunctionDef>,
    pub classes: usize,
    pub imports: Vec<ImportRecord>,
    pub references: Vec<Reference>,
    pub bare_excepts: Vec<Marker>,
    pub secrets: Vec<Marker>,
    pub max_depth: usize,
    pub complexity: usize,
}

impl Analysis {
    /// Names of module-level functions.
    pub fn top_level_functions(&self) -> impl Iterator<Item = &str> {
        self.functions
            .iter()
            .filter(|f| f.depth == 0)
            .map(|f| f.name.as_str())
    }
}

struct Statement<'a> {
    tokens: &'a [Token],
    depth: usize,
}

fn syntax(message: impl Into<String>, tok: &Token) -> SyntaxError {
    SyntaxError {
        message: message.into(),
        line: tok.line,
        col: tok.col,
    }
}

/// Walk `tokens` and collect structure for the rule table.
pub fn analyze(tokens: &[Token]) -> Result<Analysis, SyntaxError> {
    let mut analysis = Analysis::default();
    let statements = split_statements(tokens, &mut analysis)?;

    let mut aliases: HashMap<String, String> = HashMap::new();
    for stmt in &statements {
        parse_imports(stmt, &mut analysis, &mut aliases)?;
    }

    for stmt in &statements {
        let first = &stmt.tokens[0];
        match first.name() {
            Some("def") => parse_def(stmt, 1, &mut analysis)?,
            Some("async") if stmt.tokens.get(1).is_some_and(|t| t.is_name("def")) => {
                parse_def(stmt, 2, &mut analysis)?
            }
            Some("class") => parse_class(stmt, &mut analysis)?,
            Some("except") if stmt.tokens.get(1).is_some_and(|t| t.is_op(":")) => {
                analysis.bare_excepts.push(Marker {
                    line: first.line,
                    col: first.col,
                    text: "except:".into(),
                });
            }
            _ => {}
        }

        analysis.complexity += stmt
            .tokens
            .iter()
            .filter(|t| t.name().is_some_and(|n| BRANCHING.contains(&n)))
            .count();

        if !matches!(first.name(), Some("import") | Some("from")) {
            collect_references(stmt, &aliases, &mut analysis);
            collect_secrets(stmt, &mut analysis);
        }
    }

    Ok(analysis)
}

/// Split the stream into simple statements, validating block structure.
fn split_statements<'a>(
    tokens: &'a [Token],
    analysis: &mut Analysis,
) -> Result<Vec<Statement<'a>>, SyntaxError> {
    let mut statements = Vec::new();
    let mut depth = 0usize;
    let mut expect_indent: Option<usize> = None;
    let mut start: Option<usize> = None;

    for (i, tok) in tokens.iter().enumerate() {
        match tok.kind {
            TokenKind::Indent => {
                if expect_indent.take().is_none() {
                    return Err(syntax("unexpected indent", tok));
                }
                depth += 1;
                analysis.max_depth = analysis.max_depth.max(depth);
            }
            TokenKind::Dedent => {
                depth = depth.saturating_sub(1);
            }
            TokenKind::Newline => {
                if let Some(s) = start.take() {
                    let line = &tokens[s..i];
                    if line.last().is_some_and(|t| t.is_op(":")) {
                        expect_indent = Some(line[0].line);
                    }
                    split_line(line, depth, &mut statements)?;
                }
            }
            _ => {
                if start.is_none() {
                    if let Some(header_line) = expect_indent {
                        return Err(syntax(
                            format!("expected an indented block after line {header_line}"),
                            tok,
                        ));
                    }
                    start = Some(i);
                }
            }
        }
    }
    if let Some(s) = start {
        split_line(&tokens[s..], depth, &mut statements)?;
    }
    if let (Some(header_line), Some(last)) = (expect_indent, tokens.last()) {
        return Err(syntax(
            format!("expected an indented block after line {header_line}"),
            last,
        ));
    }
    Ok(statements)
}

/// Split one logical line on top-level `;` and after compound-header colons.
fn split_line<'a>(
    line: &'a [Token],
    depth: usize,
    out: &mut Vec<Statement<'a>>,
) -> Result<(), SyntaxError> {
    let mut rest = line;
    while !rest.is_empty() {
        let is_compound = rest[0].name().is_some_and(|n| COMPOUND.contains(&n));
        let mut nesting = 0i32;
        let mut cut = None;
        for (i, tok) in rest.iter().enumerate() {
            match &tok.kind {
                TokenKind::Op("(") | TokenKind::Op("[") | TokenKind::Op("{") => nesting += 1,
                TokenKind::Op(")") | TokenKind::Op("]") | TokenKind::Op("}") => nesting -= 1,
                TokenKind::Op(";") if nesting == 0 => {
                    cut = Some((i, i + 1));
                    break;
                }
                TokenKind::Op(":") if nesting == 0 && is_compound && !has_lambda(&rest[..i]) => {
                    cut = Some((i + 1, i + 1));
                    break;
                }
                _ => {}
            }
        }
        match cut {
            Some((end, next)) => {
                if end == 0 || (end == 1 && rest[0].is_op(";")) {
                    return Err(syntax("invalid syntax", &rest[0]));
                }
                out.push(Statement {
                    tokens: &rest[..end],
                    depth,
                });
                rest = &rest[next..];
            }
            None => {
                out.push(Statement { tokens: rest, depth });
                rest = &[];
            }
        }
    }
    Ok(())
}

fn has_lambda(tokens: &[Token]) -> bool {
    tokens.iter().skip(1).any(|t| t.is_name("lambda"))
}

fn parse_def(stmt: &Statement<'_>, name_at: usize, analysis: &mut Analysis) -> Result<(), SyntaxError> {
    let def_tok = &stmt.tokens[name_at - 1];
    let name = stmt
        .tokens
        .get(name_at)
        .and_then(|t| t.name())
        .filter(|n| !KEYWORDS.contains(n))
        .ok_or_else(|| syntax("invalid syntax: expected function name after 'def'", def_tok))?;
    if !stmt.tokens.get(name_at + 1).is_some_and(|t| t.is_op("(")) {
        return Err(syntax(
            format!("invalid syntax: expected '(' after 'def {name}'"),
            def_tok,
        ));
    }
    if !stmt.tokens.last().is_some_and(|t| t.is_op(":")) {
        return Err(syntax("invalid syntax: expected ':' to end function header", def_tok));
    }
    analysis.functions.push(FunctionDef {
        name: name.to_string(),
        line: def_tok.line,
        depth: stmt.depth,
    });
    Ok(())
}

fn parse_class(stmt: &Statement<'_>, analysis: &mut Analysis) -> Result<(), SyntaxError> {
    let class_tok = &stmt.tokens[0];
    let valid = stmt
        .tokens
        .get(1)
        .and_then(|t| t.name())
        .is_some_and(|n| !KEYWORDS.contains(&n))
        && stmt
            .tokens
            .get(2)
            .is_some_and(|t| t.is_op(":") || t.is_op("("));
    if !valid {
        return Err(syntax("invalid syntax: malformed class definition", class_tok));
    }
    analysis.classes += 1;
    Ok(())
}

/// Read `NAME ('.' NAME)*` starting at `at`; returns the dotted name and the
/// index after it.
fn dotted_name(tokens: &[Token], mut at: usize) -> Option<(String, usize)> {
    let mut parts = vec![tokens.get(at)?.name()?.to_string()];
    at += 1;
    while tokens.get(at).is_some_and(|t| t.is_op(".")) {
        let part = tokens.get(at + 1)?.name()?;
        parts.push(part.to_string());
        at += 2;
    }
    Some((parts.join("."), at))
}

fn parse_imports(
    stmt: &Statement<'_>,
    analysis: &mut Analysis,
    aliases: &mut HashMap<String, String>,
) -> Result<(), SyntaxError> {
    let toks = stmt.tokens;
    let first = &toks[0];
    if first.is_name("import") {
        let mut at = 1;
        loop {
            let (module, next) = dotted_name(toks, at)
                .ok_or_else(|| syntax("invalid syntax: expected module name after 'import'", first))?;
            at = next;
            let head = module.split('.').next().unwrap_or(&module).to_string();
            if toks.get(at).is_some_and(|t| t.is_name("as")) {
                let alias = toks
                    .get(at + 1)
                    .and_then(|t| t.name())
                    .ok_or_else(|| syntax("invalid syntax: expected name after 'as'", first))?;
                aliases.insert(alias.to_string(), module.clone());
                at += 2;
            } else {
                aliases.insert(head.clone(), head);
            }
            analysis.imports.push(ImportRecord {
                module,
                line: first.line,
                col: first.col,
            });
            match toks.get(at) {
                None => break,
                Some(t) if t.is_op(",") => at += 1,
                Some(t) => return Err(syntax("invalid syntax in import statement", t)),
            }
        }
    } else if first.is_name("from") {
        let mut at = 1;
        let mut module = String::new();
        while toks.get(at).is_some_and(|t| t.is_op(".") || t.is_op("...")) {
            module.push_str(if toks[at].is_op("...") { "..." } else { "." });
            at += 1;
        }
        if let Some((name, next)) = dotted_name(toks, at) {
            if name != "import" {
                module.push_str(&name);
                at = next;
            }
        }
        if module.is_empty() || !toks.get(at).is_some_and(|t| t.is_name("import")) {
            return Err(syntax("invalid syntax: expected 'from <module> import <names>'", first));
        }
        at += 1;
        analysis.imports.push(ImportRecord {
            module: module.clone(),
            line: first.line,
            col: first.col,
        });

        if toks.get(at).is_some_and(|t| t.is_op("*")) {
            return Ok(());
        }
        let parenthesized = toks.get(at).is_some_and(|t| t.is_op("("));
        if parenthesized {
            at += 1;
        }
        let mut imported_any = false;
        while let Some(tok) = toks.get(at) {
            if tok.is_op(")") && parenthesized {
                break;
            }
            if tok.is_op(",") {
                at += 1;
                continue;
            }
            let name = tok
                .name()
                .ok_or_else(|| syntax("invalid syntax in import list", tok))?;
            let bound = if toks.get(at + 1).is_some_and(|t| t.is_name("as")) {
                let alias = toks
                    .get(at + 2)
                    .and_then(|t| t.name())
                    .ok_or_else(|| syntax("invalid syntax: expected name after 'as'", tok))?;
                at += 3;
                alias.to_string()
            } else {
                at += 1;
                name.to_string()
            };
            aliases.insert(bound, format!("{module}.{name}"));
            imported_any = true;
        }
        if !imported_any {
            return Err(syntax("invalid syntax: empty import list", first));
        }
    }
    Ok(())
}

fn collect_references(
    stmt: &Statement<'_>,
    aliases: &HashMap<String, String>,
    analysis: &mut Analysis,
) {
    let toks = stmt.tokens;
    let mut i = 0;
    while i < toks.len() {
        let preceded_by_dot = i > 0 && toks[i - 1].is_op(".");
        let preceded_by_def = i > 0 && (toks[i - 1].is_name("def") || toks[i - 1].is_name("class"));
        let is_head = toks[i]
            .name()
            .is_some_and(|n| !KEYWORDS.contains(&n))
            && !preceded_by_dot
            && !preceded_by_def;
        if !is_head {
            if let Some(name) = toks[i].name().filter(|_| preceded_by_dot) {
                // Attributes of computed values, e.g. `''.__class__` or
                // `Path(p).chmod(...)`. Plain dotted names are resolved below.
                let on_expression = i >= 2 && ends_expression(&toks[i - 2]);
                if is_dunder(name) || on_expression {
                    let is_call = toks.get(i + 1).is_some_and(|t| t.is_op("("));
                    let (positional, mode_kwarg) = if is_call {
                        call_arguments(toks, i + 1)
                    } else {
                        (Vec::new(), None)
                    };
                    analysis.references.push(Reference {
                        target: format!("<expr>.{name}"),
                        line: toks[i].line,
                        col: toks[i].col,
                        is_call,
                        positional,
                        mode_kwarg,
                    });
                }
            }
            i += 1;
            continue;
        }
        let Some((dotted, next)) = dotted_name(toks, i) else {
            i += 1;
            continue;
        };

        // Keyword arguments (`f(mode='w')`) are not references.
        if toks.get(next).is_some_and(|t| t.is_op("="))
            && i > 0
            && (toks[i - 1].is_op("(") || toks[i - 1].is_op(","))
        {
            i = next;
            continue;
        }

        let target = resolve(&dotted, aliases);
        let is_call = toks.get(next).is_some_and(|t| t.is_op("("));
        let (positional, mode_kwarg) = if is_call {
            call_arguments(toks, next)
        } else {
            (Vec::new(), None)
        };
        analysis.references.push(Reference {
            target,
            line: toks[i].line,
            col: toks[i].col,
            is_call,
            positional,
            mode_kwarg,
        });
        i = next;
    }
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn resolve(dotted: &str, aliases: &HashMap<String, String>) -> String {
    let (head, tail) = match dotted.split_once('.') {
        Some((h, t)) => (h, Some(t)),
        None => (dotted, None),
    };
    match (aliases.get(head), tail) {
        (Some(full), Some(tail)) => format!("{full}.{tail}"),
        (Some(full), None) => full.clone(),
        (None, _) => dotted.to_string(),
    }
}

/// Closing brackets and literals end an expression whose attributes are
/// not part of a dotted name.
fn ends_expression(tok: &Token) -> bool {
    tok.is_op(")") || tok.is_op("]") || tok.is_op("}") || matches!(tok.kind, TokenKind::Str { .. })
}

/// Positional arguments and the `mode=` keyword at the call's top level.
fn call_arguments(toks: &[Token], open_paren: usize) -> (Vec<ArgValue>, Option<ArgValue>) {
    let mut args: Vec<&[Token]> = Vec::new();
    let mut nesting = 0i32;
    let mut start = open_paren + 1;
    let mut i = open_paren;
    while let Some(tok) = toks.get(i) {
        match &tok.kind {
            TokenKind::Op("(") | TokenKind::Op("[") | TokenKind::Op("{") => nesting += 1,
            TokenKind::Op(")") | TokenKind::Op("]") | TokenKind::Op("}") => {
                nesting -= 1;
                if nesting == 0 {
                    args.push(&toks[start..i]);
                    break;
                }
            }
            TokenKind::Op(",") if nesting == 1 => {
                args.push(&toks[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }

    let mut positional = Vec::new();
    let mut mode = None;
    for arg in args.into_iter().filter(|a| !a.is_empty()) {
        if arg[0].is_op("**") {
            mode.get_or_insert(ArgValue::Dynamic);
        } else if arg[0].is_op("*") {
            positional.push(ArgValue::Dynamic);
        } else if arg.len() >= 2 && arg[0].name().is_some() && arg[1].is_op("=") {
            if arg[0].is_name("mode") {
                mode = Some(argument_value(&arg[2..]));
            }
        } else {
            positional.push(argument_value(arg));
        }
    }
    (positional, mode)
}

fn argument_value(arg: &[Token]) -> ArgValue {
    match arg {
        [Token { kind: TokenKind::Str { prefix, value }, .. }]
            if !prefix.contains(['f', 'F']) =>
        {
            ArgValue::Literal(value.clone())
        }
        _ => ArgValue::Dynamic,
    }
}

fn collect_secrets(stmt: &Statement<'_>, analysis: &mut Analysis) {
    let toks = stmt.tokens;
    for w in toks.windows(3) {
        let (Some(name), true) = (w[0].name(), w[1].is_op("=")) else {
            continue;
        };
        if let TokenKind::Str { value, .. } = &w[2].kind {
            if !value.is_empty() && secret_name_pattern().is_some_and(|re| re.is_match(name)) {
                analysis.secrets.push(Marker {
                    line: w[0].line,
                    col: w[0].col,
                    text: name.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::lexer::tokenize;

    fn run(src: &str) -> Analysis {
        analyze(&tokenize(src).unwrap()).unwrap()
    }

    fn run_err(src: &str) -> SyntaxError {
        analyze(&tokenize(src).unwrap()).unwrap_err()
    }

    fn targets(a: &Analysis) -> Vec<&str> {
        a.references.iter().map(|r| r.target.as_str()).collect()
    }

    #[test]
    fn finds_top_level_functions_only() {
        let a = run("def init():\n    def helper():\n        pass\n    return 1\n\nclass K:\n    def execute(self):\n        pass\n");
        assert_eq!(a.top_level_functions().collect::<Vec<_>>(), vec!["init"]);
        assert_eq!(a.functions.len(), 3);
        assert_eq!(a.classes, 1);
        assert_eq!(a.max_depth, 2);
    }

    #[test]
    fn import_aliases_resolve_calls() {
        let a = run("import subprocess as sp\nfrom os import system as run\nsp.run(['ls'])\nrun('ls')\n");
        let t = targets(&a);
        assert!(t.contains(&"subprocess.run"));
        assert!(t.contains(&"os.system"));
        assert_eq!(a.imports.len(), 2);
    }

    #[test]
    fn dotted_import_binds_head() {
        let a = run("import os.path\nos.system('x')\n");
        assert!(targets(&a).contains(&"os.system"));
        assert_eq!(a.imports[0].module, "os.path");
    }

    #[test]
    fn parenthesized_from_import() {
        let a = run("from pickle import (\n    loads,\n    dumps as d,\n)\nloads(b'')\n");
        assert!(targets(&a).contains(&"pickle.loads"));
    }

    #[test]
    fn relative_import_is_recorded() {
        let a = run("from . import sibling\nfrom ..pkg.mod import thing\n");
        assert_eq!(a.imports[0].module, ".");
        assert_eq!(a.imports[1].module, "..pkg.mod");
    }

    #[test]
    fn one_line_compound_statements_are_split() {
        let a = run("if True: import socket; eval('1')\n");
        assert_eq!(a.imports.len(), 1);
        assert!(targets(&a).contains(&"eval"));
    }

    #[test]
    fn open_mode_arguments_are_captured() {
        let a = run("f = open('out.txt', 'w')\ng = open('in.txt', mode='rb')\n");
        let opens: Vec<_> = a.references.iter().filter(|r| r.target == "open").collect();
        assert_eq!(
            opens[0].positional,
            vec![ArgValue::Literal("out.txt".into()), ArgValue::Literal("w".into())]
        );
        assert_eq!(opens[1].mode_kwarg, Some(ArgValue::Literal("rb".into())));
    }

    #[test]
    fn computed_open_arguments_are_dynamic() {
        let a = run("open(path, m)\nopen(path, 'r' + x)\nopen(path, **kw)\nopen(path, *rest)\n");
        let opens: Vec<_> = a.references.iter().filter(|r| r.target == "open").collect();
        assert_eq!(opens[0].positional, vec![ArgValue::Dynamic, ArgValue::Dynamic]);
        assert_eq!(opens[1].positional[1], ArgValue::Dynamic);
        assert_eq!(opens[2].mode_kwarg, Some(ArgValue::Dynamic));
        assert_eq!(opens[3].positional, vec![ArgValue::Dynamic, ArgValue::Dynamic]);
    }

    #[test]
    fn method_calls_on_call_results_are_captured() {
        let a = run("Path(__file__).chmod(0o777)\nopen(p).write('x')\nx = foo()[0].rename('y')\n");
        let t = targets(&a);
        assert!(t.contains(&"<expr>.chmod"));
        assert!(t.contains(&"<expr>.write"));
        assert!(t.contains(&"<expr>.rename"));
        let chmod = a.references.iter().find(|r| r.target == "<expr>.chmod").unwrap();
        assert!(chmod.is_call);
    }

    #[test]
    fn keyword_argument_names_are_not_references() {
        let a = run("call(eval=1)\n");
        assert!(!targets(&a).contains(&"eval"));
    }

    #[test]
    fn definition_names_are_not_references() {
        let a = run("def eval():\n    pass\n");
        assert!(!targets(&a).contains(&"eval"));
    }

    #[test]
    fn dunder_chain_on_literal_is_captured() {
        let a = run("x = ''.__class__.__mro__[1].__subclasses__()\n");
        let t = targets(&a);
        assert!(t.contains(&"<expr>.__mro__"));
        assert!(t.contains(&"<expr>.__subclasses__"));
    }

    #[test]
    fn bare_except_and_secrets() {
        let a = run("try:\n    x = 1\nexcept:\n    pass\nAPI_KEY = 'abc123'\nname = 'ok'\n");
        assert_eq!(a.bare_excepts.len(), 1);
        assert_eq!(a.secrets.len(), 1);
        assert_eq!(a.secrets[0].text, "API_KEY");
    }

    #[test]
    fn complexity_counts_branches() {
        let a = run("def f(x):\n    if x and y:\n        pass\n    for i in x:\n        pass\n");
        assert_eq!(a.complexity, 3);
    }

    #[test]
    fn lambda_inside_header_does_not_split() {
        let a = run("if (lambda: 1)():\n    pass\n");
        assert_eq!(a.functions.len(), 0);
    }

    #[test]
    fn unexpected_indent_is_error() {
        let err = run_err("x = 1\n    y = 2\n");
        assert!(err.message.contains("unexpected indent"));
        assert_eq!(err.line, 2);
    }

    #[test]
    fn missing_block_is_error() {
        let err = run_err("def f():\nx = 1\n");
        assert!(err.message.contains("expected an indented block"));
    }

    #[test]
    fn missing_block_at_eof_is_error() {
        let err = run_err("def f():\n");
        assert!(err.message.contains("expected an indented block"));
    }

    #[test]
    fn malformed_def_is_error() {
        assert!(run_err("def (x):\n    pass\n").message.contains("function name"));
        assert!(run_err("def f x:\n    pass\n").message.contains("expected '('"));
    }

    #[test]
    fn malformed_import_is_error() {
        assert!(run_err("import\n").message.contains("module name"));
        assert!(run_err("from os\n").message.contains("from <module> import"));
    }
}
