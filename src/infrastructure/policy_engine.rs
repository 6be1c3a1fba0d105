// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Compiled expression rules.
//!
//! An [`ExprRule`] wraps a boolean expression script over the policy
//! environment, for example:
//!
//! ```text
//! operation == OP_OPEN && bitand(flag, O_WRITE) == 0
//! ```
//!
//! Scripts are compiled lazily and exactly once; the compiled program (or
//! the compile error) is memoized for the life of the rule. A compile
//! error makes the rule a permanent deny with the error reported once. A
//! program returning a non-boolean result denies with a logged error.
//!
//! Names the script references that are not part of the environment
//! evaluate as undefined rather than failing, so rules written against an
//! older environment keep working when fields are added.

use crate::domain::fs::{
    O_APPEND, O_CREATE, O_EXCL, O_RDONLY, O_RDWR, O_TRUNC, O_WRITE, O_WRONLY,
};
use crate::domain::identity::{Rule, RuleError};
use crate::domain::policy::{
    PolicyEnv, OP_MKDIR, OP_OPEN, OP_READDIR, OP_REMOVE, OP_RENAME, OP_STAT,
};
use once_cell::sync::{Lazy, OnceCell};
use rhai::{Dynamic, Engine, Scope, AST};
use std::fmt;

/// Names resolvable from the environment. Anything else is undefined.
const KNOWN_NAMES: &[&str] = &[
    "operation",
    "path",
    "flag",
    "mode",
    "subject",
    "provider",
    "groups",
    "OP_OPEN",
    "OP_STAT",
    "OP_MKDIR",
    "OP_REMOVE",
    "OP_RENAME",
    "OP_READDIR",
    "O_RDONLY",
    "O_WRONLY",
    "O_RDWR",
    "O_CREATE",
    "O_EXCL",
    "O_TRUNC",
    "O_APPEND",
    "O_WRITE",
];

/// Single shared engine. Programs compiled against it are re-entrant and
/// safe to evaluate concurrently.
static ENGINE: Lazy<Engine> = Lazy::new(|| {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(64, 64);
    engine.set_max_operations(100_000);
    engine.set_max_string_size(64 * 1024);

    engine.register_fn("bitand", |a: i64, b: i64| a & b);

    // Unknown names resolve to unit instead of erroring.
    engine.on_var(|name, _index, _context| {
        if KNOWN_NAMES.contains(&name) {
            Ok(None)
        } else {
            Ok(Some(Dynamic::UNIT))
        }
    });

    engine
});

/// A rule backed by a compiled boolean expression.
pub struct ExprRule {
    script: String,
    program: OnceCell<Result<AST, String>>,
}

impl ExprRule {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            program: OnceCell::new(),
        }
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    fn compiled(&self) -> Result<&AST, RuleError> {
        let result = self.program.get_or_init(|| {
            ENGINE.compile_expression(&self.script).map_err(|err| {
                tracing::error!(
                    script = %self.script,
                    error = %err,
                    "rule failed to compile, rule will always deny"
                );
                err.to_string()
            })
        });

        match result {
            Ok(ast) => Ok(ast),
            Err(err) => Err(RuleError::Compile(err.clone())),
        }
    }

    fn build_scope(env: &PolicyEnv) -> Scope<'static> {
        let mut scope = Scope::new();

        scope.push_constant("operation", env.operation);
        scope.push_constant("path", env.path.clone());
        scope.push_constant("flag", env.flag);
        scope.push_constant("mode", env.mode);
        scope.push_constant("subject", env.subject.clone());
        scope.push_constant("provider", env.provider.clone());
        scope.push_constant(
            "groups",
            env.groups
                .iter()
                .map(|g| Dynamic::from(g.clone()))
                .collect::<rhai::Array>(),
        );

        scope.push_constant("OP_OPEN", OP_OPEN);
        scope.push_constant("OP_STAT", OP_STAT);
        scope.push_constant("OP_MKDIR", OP_MKDIR);
        scope.push_constant("OP_REMOVE", OP_REMOVE);
        scope.push_constant("OP_RENAME", OP_RENAME);
        scope.push_constant("OP_READDIR", OP_READDIR);

        scope.push_constant("O_RDONLY", O_RDONLY);
        scope.push_constant("O_WRONLY", O_WRONLY);
        scope.push_constant("O_RDWR", O_RDWR);
        scope.push_constant("O_CREATE", O_CREATE);
        scope.push_constant("O_EXCL", O_EXCL);
        scope.push_constant("O_TRUNC", O_TRUNC);
        scope.push_constant("O_APPEND", O_APPEND);
        scope.push_constant("O_WRITE", O_WRITE);

        scope
    }
}

impl Rule for ExprRule {
    fn evaluate(&self, env: &PolicyEnv) -> Result<bool, RuleError> {
        let ast = self.compiled()?;
        let mut scope = Self::build_scope(env);

        let result = ENGINE
            .eval_ast_with_scope::<Dynamic>(&mut scope, ast)
            .map_err(|err| RuleError::Eval(err.to_string()))?;

        result.as_bool().map_err(|_| RuleError::NotBoolean)
    }
}

impl fmt::Display for ExprRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.script)
    }
}
