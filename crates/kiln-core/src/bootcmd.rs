//! Boot command parsing.
//!
//! A boot command is a list of lines typed into the VM console. Plain
//! characters are typed as-is; special keys and pauses use angle-bracket
//! tokens such as `<enter>`, `<tab>`, `<f2>`, `<wait>` or `<wait10s>`.
//! An unrecognised token is typed literally.

use crate::error::{BuildError, Result};
use std::time::Duration;

/// Pause inserted by a bare `<wait>`.
const DEFAULT_WAIT: Duration = Duration::from_secs(1);

/// A key sent to the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootKey {
    Char(char),
    Enter,
    Tab,
    Escape,
    Backspace,
    Delete,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    /// Function key F1 to F12.
    Function(u8),
}

/// One unit of a parsed boot command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAction {
    Key(BootKey),
    Wait(Duration),
}

/// Parse every line of a boot command, in order.
pub fn parse(lines: &[String]) -> Result<Vec<BootAction>> {
    let mut actions = Vec::new();
    for line in lines {
        actions.extend(parse_line(line)?);
    }
    Ok(actions)
}

/// Parse one line of a boot command.
pub fn parse_line(line: &str) -> Result<Vec<BootAction>> {
    let mut actions = Vec::new();
    let mut rest = line;

    while let Some(c) = rest.chars().next() {
        if c == '<' {
            if let Some(end) = rest.find('>') {
                let token = &rest[1..end];
                if let Some(action) = special(token)? {
                    actions.push(action);
                    rest = &rest[end + 1..];
                    continue;
                }
            }
        }
        actions.push(BootAction::Key(BootKey::Char(c)));
        rest = &rest[c.len_utf8()..];
    }
    Ok(actions)
}

fn special(token: &str) -> Result<Option<BootAction>> {
    let token = token.to_ascii_lowercase();
    let key = match token.as_str() {
        "enter" | "return" => BootKey::Enter,
        "tab" => BootKey::Tab,
        "esc" => BootKey::Escape,
        "bs" => BootKey::Backspace,
        "del" => BootKey::Delete,
        "spacebar" => BootKey::Char(' '),
        "up" => BootKey::Up,
        "down" => BootKey::Down,
        "left" => BootKey::Left,
        "right" => BootKey::Right,
        "home" => BootKey::Home,
        "end" => BootKey::End,
        "pageup" => BootKey::PageUp,
        "pagedown" => BootKey::PageDown,
        t if t.starts_with("wait") => return wait(&t[4..]).map(Some),
        t => match t.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
            Some(n @ 1..=12) => BootKey::Function(n),
            _ => return Ok(None),
        },
    };
    Ok(Some(BootAction::Key(key)))
}

fn wait(spec: &str) -> Result<BootAction> {
    if spec.is_empty() {
        return Ok(BootAction::Wait(DEFAULT_WAIT));
    }
    let invalid = || BuildError::InvalidConfig(format!("invalid boot command wait '<wait{spec}>'"));

    let (digits, unit): (&str, fn(u64) -> Duration) = if let Some(n) = spec.strip_suffix("ms") {
        (n, Duration::from_millis)
    } else if let Some(n) = spec.strip_suffix('s') {
        (n, Duration::from_secs)
    } else if let Some(n) = spec.strip_suffix('m') {
        (n, minutes)
    } else {
        (spec, Duration::from_secs)
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    Ok(BootAction::Wait(unit(value)))
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(line: &str) -> Vec<BootAction> {
        parse_line(line).unwrap()
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(
            keys("ls"),
            vec![
                BootAction::Key(BootKey::Char('l')),
                BootAction::Key(BootKey::Char('s')),
            ]
        );
    }

    #[test]
    fn test_special_keys() {
        assert_eq!(
            keys("<esc><TAB>x<enter>"),
            vec![
                BootAction::Key(BootKey::Escape),
                BootAction::Key(BootKey::Tab),
                BootAction::Key(BootKey::Char('x')),
                BootAction::Key(BootKey::Enter),
            ]
        );
        assert_eq!(keys("<f12>"), vec![BootAction::Key(BootKey::Function(12))]);
        assert_eq!(keys("<spacebar>"), vec![BootAction::Key(BootKey::Char(' '))]);
    }

    #[test]
    fn test_waits() {
        assert_eq!(keys("<wait>"), vec![BootAction::Wait(Duration::from_secs(1))]);
        assert_eq!(keys("<wait5>"), vec![BootAction::Wait(Duration::from_secs(5))]);
        assert_eq!(keys("<wait10s>"), vec![BootAction::Wait(Duration::from_secs(10))]);
        assert_eq!(keys("<wait250ms>"), vec![BootAction::Wait(Duration::from_millis(250))]);
        assert_eq!(keys("<wait2m>"), vec![BootAction::Wait(Duration::from_secs(120))]);
        assert!(parse_line("<waitforever>").is_err());
    }

    #[test]
    fn test_unknown_token_is_literal() {
        let actions = keys("a<b>");
        assert_eq!(actions.len(), 4);
        assert_eq!(actions[1], BootAction::Key(BootKey::Char('<')));
        assert_eq!(actions[3], BootAction::Key(BootKey::Char('>')));
        assert_eq!(keys("<f13>").len(), 5);
    }

    #[test]
    fn test_parse_joins_lines() {
        let lines = vec!["a".to_string(), "<enter>".to_string()];
        assert_eq!(parse(&lines).unwrap().len(), 2);
    }
}
