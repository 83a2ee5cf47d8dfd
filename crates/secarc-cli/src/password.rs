//! Password input: terminal prompts, or one line per password from stdin

use std::io::{BufRead, IsTerminal, Lines, StdinLock};

use anyhow::{bail, Context, Result};
use secrecy::{ExposeSecret, SecretString};

pub enum PasswordSource {
    /// Prompt on the terminal without echo; new passwords are asked twice
    Prompt,
    /// Read each password as one line of stdin, no confirmation
    Stdin(Lines<StdinLock<'static>>),
}

impl PasswordSource {
    pub fn new(from_stdin: bool) -> Self {
        if from_stdin {
            Self::Stdin(std::io::stdin().lock().lines())
        } else {
            Self::Prompt
        }
    }

    /// Read a password for an existing container.
    pub fn existing(&mut self, prompt: &str) -> Result<SecretString> {
        let password = self.read(prompt)?;
        if password.expose_secret().is_empty() {
            bail!("empty password");
        }
        Ok(password)
    }

    /// Read a password that is about to protect a container.
    pub fn new_password(&mut self, prompt: &str) -> Result<SecretString> {
        let password = self.existing(prompt)?;
        if let Self::Prompt = self {
            let confirm = self.read("Confirm password: ")?;
            if confirm.expose_secret() != password.expose_secret() {
                bail!("passwords do not match");
            }
        }
        Ok(password)
    }

    fn read(&mut self, prompt: &str) -> Result<SecretString> {
        match self {
            Self::Prompt => {
                if !std::io::stdin().is_terminal() {
                    bail!("stdin is not a terminal; use --password-stdin to pipe passwords");
                }
                let line = rpassword::prompt_password(prompt).context("reading password")?;
                Ok(SecretString::from(line))
            }
            Self::Stdin(lines) => {
                let Some(line) = lines.next() else {
                    bail!("expected a password on stdin");
                };
                let mut line = line.context("reading password from stdin")?;
                if line.ends_with('\r') {
                    line.pop();
                }
                Ok(SecretString::from(line))
            }
        }
    }
}
