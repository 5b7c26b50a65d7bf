use crate::execution::ResultHostData;

const RECAP_MARKER: &str = "PLAY RECAP";

/// Collects per-host statistics from the `PLAY RECAP` block of ansible-playbook output.
///
/// ```text
/// PLAY RECAP *********************************************************
/// web1 : ok=3 changed=1 unreachable=0 failed=0 skipped=2 rescued=0 ignored=0
/// ```
///
/// Lines are fed one at a time while the output is streamed.
#[derive(Debug, Default)]
pub struct RecapParser {
    in_recap: bool,
    hosts: Vec<ResultHostData>,
}

impl RecapParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: &str) {
        let plain: String = strip_ansi(line);
        let line: &str = plain.trim();
        if line.starts_with(RECAP_MARKER) {
            self.in_recap = true;
            return;
        }
        if !self.in_recap || line.is_empty() {
            return;
        }
        if let Some(host) = parse_host_line(line) {
            match self.hosts.iter_mut().find(|known| known.hostname == host.hostname) {
                Some(known) => *known = host,
                None => self.hosts.push(host),
            }
        }
    }

    pub fn into_hosts(self) -> Vec<ResultHostData> {
        self.hosts
    }
}

/// Removes `ESC [ ... <final>` sequences such as colour codes.
fn strip_ansi(line: &str) -> String {
    let mut plain = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        } else {
            plain.push(c);
        }
    }
    plain
}

fn parse_host_line(line: &str) -> Option<ResultHostData> {
    let (hostname, counters) = line.split_once(" : ")?;
    let mut host = ResultHostData {
        hostname: hostname.trim().to_string(),
        ..Default::default()
    };
    let mut seen_ok: bool = false;
    for pair in counters.split_whitespace() {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let Ok(value) = value.parse::<u32>() else {
            continue;
        };
        match key {
            "ok" => {
                host.tasks_ok = value;
                seen_ok = true;
            }
            "changed" => host.tasks_changed = value,
            "unreachable" => host.unreachable = value > 0,
            "failed" => host.tasks_failed = value,
            "skipped" => host.tasks_skipped = value,
            "rescued" => host.tasks_rescued = value,
            "ignored" => host.tasks_ignored = value,
            _ => {}
        }
    }
    if seen_ok && !host.hostname.is_empty() {
        Some(host)
    } else {
        None
    }
}
