//! Reader for the machine-scoped login file (`~/.netrc`).
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Default)]
pub struct Netrc {
    machines: Vec<(String, Login)>,
    default: Option<Login>,
}

#[derive(Default)]
struct Entry {
    login: Option<String>,
    password: Option<String>,
}

impl Entry {
    fn finish(self) -> Option<Login> {
        Some(Login {
            login: self.login?,
            password: self.password?,
        })
    }
}

enum Target {
    Machine(String),
    Default,
}

impl Netrc {
    pub fn read<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut netrc = Netrc::default();
        let mut current: Option<(Target, Entry)> = None;

        let mut lines = content.lines();
        while let Some(line) = lines.next() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            let mut tokens = line.split_whitespace();
            while let Some(token) = tokens.next() {
                match token {
                    "machine" | "default" => {
                        if let Some((target, entry)) = current.take() {
                            netrc.push(target, entry);
                        }
                        let target = if token == "default" {
                            Target::Default
                        } else {
                            match tokens.next() {
                                Some(name) => Target::Machine(name.to_string()),
                                None => continue,
                            }
                        };
                        current = Some((target, Entry::default()));
                    }
                    "login" => {
                        if let (Some((_, entry)), Some(value)) = (current.as_mut(), tokens.next()) {
                            entry.login = Some(value.to_string());
                        }
                    }
                    "password" => {
                        if let (Some((_, entry)), Some(value)) = (current.as_mut(), tokens.next()) {
                            entry.password = Some(value.to_string());
                        }
                    }
                    "account" => {
                        tokens.next();
                    }
                    // Macro bodies run until the next blank line
                    "macdef" => {
                        for body in lines.by_ref() {
                            if body.trim().is_empty() {
                                break;
                            }
                        }
                        break;
                    }
                    _ => {}
                }
            }
        }
        if let Some((target, entry)) = current.take() {
            netrc.push(target, entry);
        }
        netrc
    }

    fn push(&mut self, target: Target, entry: Entry) {
        let Some(login) = entry.finish() else {
            return;
        };
        match target {
            Target::Machine(host) => self.machines.push((host, login)),
            Target::Default => self.default = Some(login),
        }
    }

    /// Login for `host`, falling back to the `default` entry.
    pub fn authenticator(&self, host: &str) -> Option<&Login> {
        self.machines
            .iter()
            .find(|(machine, _)| machine == host)
            .map(|(_, login)| login)
            .or(self.default.as_ref())
    }
}
