//! Static acceptance filter for submitted scripts.
//!
//! Evaluation is a structural scan of the token stream followed by a Rhai
//! parse; nothing is ever executed. Every violation found is reported, and
//! any single one rejects the submission.

use std::collections::BTreeSet;

use rhai::Engine;

use crate::core::lexer::{Token, TokenKind, tokenize};
use crate::core::policy::ValidationPolicy;
use crate::core::types::{Rule, Violation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(Vec<Violation>),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Verdict::Accepted => &[],
            Verdict::Rejected(violations) => violations,
        }
    }
}

impl ValidationPolicy {
    /// Decide whether `source` may run.
    pub fn evaluate(&self, source: &str) -> Verdict {
        self.scan(source, None)
    }

    /// Like [`evaluate`](Self::evaluate), additionally requiring a definition of
    /// `fn <name>(params)`.
    pub fn evaluate_procedure(&self, name: &str, source: &str) -> Verdict {
        self.scan(source, Some(name))
    }

    fn scan(&self, source: &str, procedure: Option<&str>) -> Verdict {
        let tokens = match tokenize(source) {
            Ok(tokens) => tokens,
            Err(err) => {
                return Verdict::Rejected(vec![Violation {
                    rule: Rule::Syntax,
                    line: err.line,
                    column: err.column,
                    detail: err.message,
                }]);
            }
        };

        let declared = Declarations::collect(&tokens);
        let mut violations = Vec::new();
        self.check_tokens(&tokens, &declared, &mut violations);
        self.check_bindings(&declared, &mut violations);
        if let Some(name) = procedure
            && !defines_procedure(&tokens, name)
        {
            violations.push(Violation {
                rule: Rule::ProcedureSignature,
                line: 1,
                column: 1,
                detail: format!("procedure must define `fn {name}(params)` taking one argument"),
            });
        }
        violations.extend(syntax_violation(source));
        violations.sort_by_key(|v| (v.line, v.column));

        if violations.is_empty() {
            Verdict::Accepted
        } else {
            Verdict::Rejected(violations)
        }
    }

    fn check_tokens(&self, tokens: &[Token], declared: &Declarations<'_>, out: &mut Vec<Violation>) {
        for (i, token) in tokens.iter().enumerate() {
            if token.kind != TokenKind::Ident {
                continue;
            }
            let name = token.text.as_str();
            let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
            let next = tokens.get(i + 1);
            let after = |text: &str| prev.is_some_and(|p| p.is_punct(text));
            let before = |text: &str| next.is_some_and(|n| n.is_punct(text));

            if after(".") || after("?.") {
                if self.is_forbidden_call(name) && before("(") {
                    out.push(violation(
                        Rule::ForbiddenCall,
                        token,
                        format!("method `{name}` is forbidden"),
                    ));
                } else if self.is_forbidden_attribute(name) {
                    out.push(violation(
                        Rule::Introspection,
                        token,
                        format!("access to internal attribute `{name}` is forbidden"),
                    ));
                } else if before("(")
                    && !self.is_known_identifier(name)
                    && !declared.functions.contains(name)
                {
                    // Method syntax reaches any registered function.
                    out.push(violation(
                        Rule::UnknownIdentifier,
                        token,
                        format!("method `{name}` is not a whitelisted or declared function"),
                    ));
                }
                continue;
            }
            if name == "import" {
                self.check_import(token, next, out);
                continue;
            }
            // Qualified tails are resolved through their namespace; declaration
            // sites and map-literal keys are not references.
            if after("::") || prev.is_some_and(|p| p.is_ident("as")) || before(":") {
                continue;
            }
            if self.is_forbidden_call(name) {
                out.push(violation(
                    Rule::ForbiddenCall,
                    token,
                    format!("`{name}` is a forbidden primitive"),
                ));
                continue;
            }
            if before("::") {
                if !self.is_injected_namespace(name) && !declared.aliases.contains(name) {
                    out.push(violation(
                        Rule::UnknownIdentifier,
                        token,
                        format!("unknown module namespace `{name}`"),
                    ));
                }
                continue;
            }
            if !self.is_known_identifier(name) && !declared.names.contains(name) {
                out.push(violation(
                    Rule::UnknownIdentifier,
                    token,
                    format!("`{name}` is not a declared, injected, or whitelisted name"),
                ));
            }
        }
    }

    /// Scripts may not rebind injected constants or redefine injected functions.
    fn check_bindings(&self, declared: &Declarations<'_>, out: &mut Vec<Violation>) {
        let constants = declared
            .bindings
            .iter()
            .filter(|token| self.is_injected_constant(&token.text));
        let functions = declared
            .definitions
            .iter()
            .filter(|token| self.is_injected(&token.text));
        for token in constants.chain(functions) {
            out.push(violation(
                Rule::ReservedName,
                token,
                format!("`{}` is provided by the sandbox and cannot be redeclared", token.text),
            ));
        }
    }

    fn check_import(&self, token: &Token, path: Option<&Token>, out: &mut Vec<Violation>) {
        match path {
            Some(path) if path.kind == TokenKind::Str => {
                if !self.allows_module(&path.text) {
                    out.push(violation(
                        Rule::Import,
                        token,
                        format!("module `{}` is not in the import allow-list", path.text),
                    ));
                }
            }
            Some(path) => out.push(violation(
                Rule::Import,
                token,
                format!(
                    "module `{}` is not in the import allow-list (paths must be string literals)",
                    path.text
                ),
            )),
            None => out.push(violation(
                Rule::Import,
                token,
                "`import` without a module path".to_string(),
            )),
        }
    }
}

fn violation(rule: Rule, token: &Token, detail: String) -> Violation {
    Violation {
        rule,
        line: token.line,
        column: token.column,
        detail,
    }
}

/// Names the script introduces itself. Scoping is ignored: a name declared
/// anywhere is accepted everywhere, and the runtime reports real scope errors.
#[derive(Debug, Default)]
struct Declarations<'a> {
    /// Variable and parameter binding sites.
    bindings: Vec<&'a Token>,
    /// `fn` name sites.
    definitions: Vec<&'a Token>,
    names: BTreeSet<&'a str>,
    functions: BTreeSet<&'a str>,
    aliases: BTreeSet<&'a str>,
}

impl<'a> Declarations<'a> {
    fn collect(tokens: &'a [Token]) -> Self {
        let mut declared = Self::default();
        for (i, token) in tokens.iter().enumerate() {
            if token.is_punct("|") && opens_closure(tokens, i) {
                declared.bind(parameter_list(tokens, i + 1, "|"));
                continue;
            }
            if token.kind != TokenKind::Ident {
                continue;
            }
            match token.text.as_str() {
                "let" | "const" => declared.bind(ident_at(tokens, i + 1)),
                "fn" => {
                    if let Some(name) = ident_at(tokens, i + 1) {
                        declared.functions.insert(name.text.as_str());
                        declared.names.insert(name.text.as_str());
                        declared.definitions.push(name);
                    }
                    if tokens.get(i + 2).is_some_and(|t| t.is_punct("(")) {
                        declared.bind(parameter_list(tokens, i + 3, ")"));
                    }
                }
                "for" => {
                    if tokens.get(i + 1).is_some_and(|t| t.is_punct("(")) {
                        declared.bind(parameter_list(tokens, i + 2, ")"));
                    } else {
                        declared.bind(ident_at(tokens, i + 1));
                    }
                }
                "catch" => {
                    if tokens.get(i + 1).is_some_and(|t| t.is_punct("(")) {
                        declared.bind(ident_at(tokens, i + 2));
                    }
                }
                "as" => {
                    let after_import_path = i >= 2
                        && tokens[i - 1].kind == TokenKind::Str
                        && tokens[i - 2].is_ident("import");
                    if after_import_path && let Some(alias) = ident_at(tokens, i + 1) {
                        declared.aliases.insert(alias.text.as_str());
                    }
                }
                _ => {}
            }
        }
        declared
    }

    fn bind(&mut self, tokens: impl IntoIterator<Item = &'a Token>) {
        for token in tokens {
            self.names.insert(token.text.as_str());
            self.bindings.push(token);
        }
    }
}

fn ident_at(tokens: &[Token], index: usize) -> Option<&Token> {
    tokens.get(index).filter(|t| t.kind == TokenKind::Ident)
}

/// Comma-separated identifiers starting at `start`, up to the `close` punctuation.
fn parameter_list<'a>(tokens: &'a [Token], start: usize, close: &str) -> Vec<&'a Token> {
    let mut names = Vec::new();
    for token in tokens.iter().skip(start) {
        if token.is_punct(close) {
            break;
        }
        match token.kind {
            TokenKind::Ident => names.push(token),
            TokenKind::Punct if token.text == "," => {}
            _ => return Vec::new(),
        }
    }
    names
}

/// A `|` opens a closure only where an expression may start.
fn opens_closure(tokens: &[Token], index: usize) -> bool {
    match index.checked_sub(1).and_then(|p| tokens.get(p)) {
        None => true,
        Some(prev) => {
            prev.is_ident("return")
                || ["(", ",", "=", ":", "{", ";", "=>", "["]
                    .iter()
                    .any(|p| prev.is_punct(p))
        }
    }
}

fn defines_procedure(tokens: &[Token], name: &str) -> bool {
    tokens.windows(3).enumerate().any(|(i, w)| {
        w[0].is_ident("fn")
            && w[1].is_ident(name)
            && w[2].is_punct("(")
            && parameter_list(tokens, i + 3, ")").len() == 1
    })
}

fn syntax_violation(source: &str) -> Option<Violation> {
    let engine = Engine::new_raw();
    let err = engine.compile(source).err()?;
    let position = err.1;
    Some(Violation {
        rule: Rule::Syntax,
        line: to_u32(position.line().unwrap_or(1)),
        column: to_u32(position.position().unwrap_or(1)),
        detail: err.0.to_string(),
    })
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::policy::PolicyRules;

    fn policy() -> ValidationPolicy {
        ValidationPolicy::compile(&PolicyRules::default(), Duration::from_secs(1)).expect("policy")
    }

    fn rules_of(verdict: &Verdict) -> Vec<Rule> {
        verdict.violations().iter().map(|v| v.rule).collect()
    }

    /// Verifies plain capability code is accepted.
    #[test]
    fn accepts_capability_calls() {
        let verdict = policy().evaluate("move(EAST);\nattack(EAST);");
        assert_eq!(verdict, Verdict::Accepted);
    }

    /// Verifies a disallowed import is rejected and named.
    #[test]
    fn rejects_disallowed_import() {
        let verdict = policy().evaluate("import \"os\" as os;\nmove(EAST);");
        assert_eq!(rules_of(&verdict), vec![Rule::Import]);
        let v = &verdict.violations()[0];
        assert!(v.detail.contains("`os`"));
        assert_eq!((v.line, v.column), (1, 1));
    }

    /// Verifies a bare, non-literal import is rejected as an import.
    #[test]
    fn rejects_bare_import() {
        let verdict = policy().evaluate("import os;");
        assert!(rules_of(&verdict).contains(&Rule::Import));
        assert!(verdict.violations()[0].detail.contains("`os`"));
    }

    /// Verifies allow-listed imports and their aliases are accepted.
    #[test]
    fn accepts_allowed_import_alias() {
        let verdict = policy().evaluate("import \"math\" as m;\nlet hp = m::clamp(5, 0, 3);");
        assert_eq!(verdict, Verdict::Accepted);
    }

    /// Verifies dynamic evaluation primitives are rejected wherever they appear.
    #[test]
    fn rejects_dynamic_evaluation() {
        let verdict = policy().evaluate("eval(\"move(EAST)\");");
        assert!(rules_of(&verdict).contains(&Rule::ForbiddenCall));

        let verdict = policy().evaluate("let f = Fn(\"move\");\nf.call(EAST);");
        let rules = rules_of(&verdict);
        assert_eq!(
            rules
                .iter()
                .filter(|r| **r == Rule::ForbiddenCall)
                .count(),
            2
        );
    }

    /// Verifies internal attribute access is rejected even without a call.
    #[test]
    fn rejects_introspection() {
        let verdict = policy().evaluate("let p = position();\nlet t = p.tag;\nlet x = p.__proto__;");
        let introspection: Vec<&Violation> = verdict
            .violations()
            .iter()
            .filter(|v| v.rule == Rule::Introspection)
            .collect();
        assert_eq!(introspection.len(), 2);
        assert_eq!(introspection[0].line, 2);
    }

    /// Verifies identifiers outside every whitelist are rejected.
    #[test]
    fn rejects_unknown_identifiers() {
        let verdict = policy().evaluate("let f = File;\nstd::fs::remove(f);");
        let rules = rules_of(&verdict);
        assert_eq!(rules, vec![Rule::UnknownIdentifier, Rule::UnknownIdentifier]);
    }

    /// Verifies locally declared names of every kind are accepted.
    #[test]
    fn accepts_local_declarations() {
        let source = r#"
            const LIMIT = 3;
            fn step(dir, times) {
                for i in range(0, times) { move(dir); }
                times
            }
            let counts = #{ hits: 0, misses: 0 };
            let pick = |a, b| if a > b { a } else { b };
            for (item, index) in inventory() { print(`${index}: ${item}`); }
            try { attack(Direction::E); } catch (err) { print(err); }
            switch LIMIT { 1 => step(EAST, 1), _ => step(WEST, pick(1, 2)) }
            counts.hits += 1;
        "#;
        let verdict = policy().evaluate(source);
        assert_eq!(verdict, Verdict::Accepted, "{:?}", verdict.violations());
    }

    /// Verifies method syntax cannot reach functions outside the whitelist.
    #[test]
    fn rejects_unlisted_method_calls() {
        let verdict = policy().evaluate("let s = \"a\";\ns.pad(3, \"b\");");
        assert_eq!(rules_of(&verdict), vec![Rule::UnknownIdentifier]);
        assert!(verdict.violations()[0].detail.contains("`pad`"));

        let verdict = policy().evaluate("let a = [1];\na.extract(0);");
        assert_eq!(rules_of(&verdict), vec![Rule::UnknownIdentifier]);

        let source = "fn twice(x) { x * 2 }\nlet v = 2;\nlet n = v.twice();\nlet s = \"ab\";\nlet k = s.len();\nlet p = position().offset(EAST);\nlet hp = p.x;";
        let verdict = policy().evaluate(source);
        assert_eq!(verdict, Verdict::Accepted, "{:?}", verdict.violations());
    }

    /// Verifies scripts cannot rebind direction constants or replace capabilities.
    #[test]
    fn rejects_reserved_names() {
        let verdict = policy().evaluate("let UP = 3;\nUP + 1");
        assert_eq!(rules_of(&verdict), vec![Rule::ReservedName]);
        assert_eq!(verdict.violations()[0].line, 1);

        let verdict = policy().evaluate("fn move(dir) { }\nfor EAST in range(0, 2) { }");
        assert_eq!(rules_of(&verdict), vec![Rule::ReservedName, Rule::ReservedName]);

        let verdict = policy().evaluate("let message = message();\nprint(message);");
        assert_eq!(verdict, Verdict::Accepted, "{:?}", verdict.violations());
    }

    /// Verifies unconditional loops pass static checks; the sandbox bounds them.
    #[test]
    fn accepts_infinite_loop() {
        assert!(policy().evaluate("loop { }").is_accepted());
    }

    /// Verifies syntax errors carry a location.
    #[test]
    fn rejects_syntax_errors() {
        let verdict = policy().evaluate("let = ;");
        assert_eq!(rules_of(&verdict), vec![Rule::Syntax]);

        let verdict = policy().evaluate("move(EAST);\nlet s = \"open");
        let v = &verdict.violations()[0];
        assert_eq!((v.rule, v.line), (Rule::Syntax, 2));
    }

    /// Verifies every violation is reported in source order.
    #[test]
    fn reports_all_violations_in_order() {
        let verdict = policy().evaluate("import \"net\" as n;\neval(\"1\");\nlet x = secret;");
        assert_eq!(
            rules_of(&verdict),
            vec![Rule::Import, Rule::ForbiddenCall, Rule::UnknownIdentifier]
        );
    }

    /// Verifies procedure mode requires the named single-argument function.
    #[test]
    fn procedure_signature() {
        let p = policy();
        assert!(
            p.evaluate_procedure("flee", "fn flee(params) { move(WEST); }")
                .is_accepted()
        );
        let verdict = p.evaluate_procedure("flee", "fn run_away(params) { move(WEST); }");
        assert_eq!(rules_of(&verdict), vec![Rule::ProcedureSignature]);
        let verdict = p.evaluate_procedure("flee", "fn flee() { move(WEST); }");
        assert_eq!(rules_of(&verdict), vec![Rule::ProcedureSignature]);
    }
}
