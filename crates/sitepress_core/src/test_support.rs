use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::sync::mpsc::Sender;

use crate::args::join_tokens;
use crate::exec::{CapturedOutput, ProcessRunner, StreamEvent};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Stdout(String),
    Stderr(String),
    Exit(i32),
    SpawnError(String),
    Stream(Vec<StreamEvent>),
}

impl Reply {
    pub(crate) fn stdout(text: &str) -> Self {
        Self::Stdout(text.to_string())
    }

    pub(crate) fn stderr(text: &str) -> Self {
        Self::Stderr(text.to_string())
    }

    pub(crate) fn json(value: serde_json::Value) -> Self {
        Self::Stdout(value.to_string())
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    replies: VecDeque<Reply>,
}

/// Stand-in for the external tool. Calls are matched against rules by
/// substring of the joined argument list; a rule hands out its replies in
/// order and keeps repeating the last one. Unmatched calls succeed with empty
/// output.
#[derive(Debug, Default)]
pub(crate) struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub(crate) fn on(&self, pattern: &str, reply: Reply) {
        let mut rules = self.rules.lock().expect("rules lock");
        if let Some(rule) = rules.iter_mut().find(|rule| rule.pattern == pattern) {
            rule.replies.push_back(reply);
        } else {
            rules.push(Rule {
                pattern: pattern.to_string(),
                replies: VecDeque::from([reply]),
            });
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn count(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.contains(pattern))
            .count()
    }

    fn next_reply(&self, args: &[String]) -> Reply {
        let line = join_tokens(args);
        self.calls.lock().expect("calls lock").push(line.clone());

        let mut rules = self.rules.lock().expect("rules lock");
        let Some(rule) = rules.iter_mut().find(|rule| line.contains(&rule.pattern)) else {
            return Reply::Stdout(String::new());
        };
        if rule.replies.len() > 1 {
            rule.replies.pop_front().expect("reply queued")
        } else {
            rule.replies.front().cloned().expect("reply queued")
        }
    }
}

impl ProcessRunner for ScriptedRunner {
    fn capture(&self, _program: &str, args: &[String]) -> io::Result<CapturedOutput> {
        match self.next_reply(args) {
            Reply::Stdout(stdout) => Ok(CapturedOutput {
                stdout,
                stderr: String::new(),
                exit_code: Some(0),
            }),
            Reply::Stderr(stderr) => Ok(CapturedOutput {
                stdout: String::new(),
                stderr,
                exit_code: Some(0),
            }),
            Reply::Exit(code) => Ok(CapturedOutput {
                exit_code: Some(code),
                ..CapturedOutput::default()
            }),
            Reply::SpawnError(message) => Err(io::Error::other(message)),
            Reply::Stream(_) => Err(io::Error::other("stream reply used for buffered call")),
        }
    }

    fn stream(
        &self,
        _program: &str,
        args: &[String],
        events: Sender<StreamEvent>,
    ) -> io::Result<()> {
        let replay = match self.next_reply(args) {
            Reply::Stream(replay) => replay,
            Reply::Stdout(text) => vec![StreamEvent::Stdout(text), StreamEvent::StdoutClosed],
            Reply::Stderr(text) => vec![StreamEvent::Stderr(text)],
            Reply::Exit(_) => vec![StreamEvent::StdoutClosed],
            Reply::SpawnError(message) => return Err(io::Error::other(message)),
        };
        for event in replay {
            let _ = events.send(event);
        }
        Ok(())
    }
}
