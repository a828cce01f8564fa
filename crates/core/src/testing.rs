//! Scripted [`CommandRunner`] for tests.
//!
//! Rules match on program plus leading arguments; the first matching rule
//! wins and anything unmatched succeeds with empty output. Every invocation is
//! recorded so tests can assert on what ran (or that nothing did).

use crate::process::{CommandOutput, CommandRunner, CommandSpec, ProcessError};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

enum Reply {
    Output(CommandOutput),
    NotInstalled,
}

struct Rule {
    prefix: Vec<String>,
    reply: Reply,
}

impl Rule {
    fn matches(&self, spec: &CommandSpec) -> bool {
        let Some((program, args)) = self.prefix.split_first() else {
            return false;
        };
        program == &spec.program
            && args.len() <= spec.args.len()
            && args.iter().zip(&spec.args).all(|(want, got)| want == got)
    }
}

#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `output` to commands starting with `prefix` (program first)
    pub fn on(self, prefix: &[&str], output: CommandOutput) -> Self {
        self.push(prefix, Reply::Output(output));
        self
    }

    /// Make `program` look uninstalled
    pub fn missing(self, program: &str) -> Self {
        self.push(&[program], Reply::NotInstalled);
        self
    }

    fn push(&self, prefix: &[&str], reply: Reply) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                prefix: prefix.iter().map(|s| s.to_string()).collect(),
                reply,
            });
        }
    }

    /// Every command run so far
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of recorded commands starting with `prefix`
    pub fn count(&self, prefix: &[&str]) -> usize {
        let pattern = Rule {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            reply: Reply::NotInstalled,
        };
        self.calls().iter().filter(|spec| pattern.matches(spec)).count()
    }

    /// First recorded command starting with `prefix`
    pub fn find(&self, prefix: &[&str]) -> Option<CommandSpec> {
        let pattern = Rule {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            reply: Reply::NotInstalled,
        };
        self.calls().into_iter().find(|spec| pattern.matches(spec))
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        _cancel: &CancellationToken,
    ) -> Result<CommandOutput, ProcessError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.clone());
        }
        let rules = match self.rules.lock() {
            Ok(rules) => rules,
            Err(_) => return Ok(CommandOutput::ok("")),
        };
        match rules.iter().find(|rule| rule.matches(spec)).map(|rule| &rule.reply) {
            Some(Reply::Output(output)) => Ok(output.clone()),
            Some(Reply::NotInstalled) => Err(ProcessError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
            }),
            None => Ok(CommandOutput::ok("")),
        }
    }
}
