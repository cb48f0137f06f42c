//! Parser for the `ratelimit` directive syntax.
//!
//! ```text
//! # all resources, 100 requests per minute
//! ratelimit * 100 100 minute
//!
//! # one resource on the directive line, more in the block
//! ratelimit GET,POST /api 10 20 second {
//!     /login
//!     whitelist 10.0.0.0/8
//! }
//! ```
//!
//! Any error rejects the whole source; no partial rule set is returned.

use ipnet::IpNet;

use super::key::KEY_SEPARATOR;
use super::rules::RateRule;
use crate::error::{Result, TurnstileError};

const DIRECTIVE: &str = "ratelimit";
const WHITELIST: &str = "whitelist";
const BLOCK_OPEN: &str = "{";
const BLOCK_CLOSE: &str = "}";

/// Parse every `ratelimit` directive in `source`.
pub(crate) fn parse_rules(source: &str) -> Result<Vec<RateRule>> {
    let mut lines = source.lines().enumerate().map(|(i, text)| (i + 1, text));
    let mut rules = Vec::new();

    while let Some((line, text)) = lines.next() {
        let mut tokens = tokenize(line, text)?;
        if tokens.is_empty() {
            continue;
        }
        if tokens[0] != DIRECTIVE {
            return Err(TurnstileError::syntax(
                line,
                format!("unknown directive '{}', expecting '{}'", tokens[0], DIRECTIVE),
            ));
        }

        let opens_block = tokens.last().map(String::as_str) == Some(BLOCK_OPEN);
        if opens_block {
            tokens.pop();
        }

        let mut rule = parse_directive(line, &tokens[1..])?;

        if opens_block {
            let mut closed = false;
            for (block_line, block_text) in lines.by_ref() {
                let tokens = tokenize(block_line, block_text)?;
                match tokens.as_slice() {
                    [] => {}
                    [close] if close == BLOCK_CLOSE => {
                        closed = true;
                        break;
                    }
                    [open] if open == BLOCK_OPEN => {
                        return Err(TurnstileError::syntax(block_line, "nested blocks are not allowed"));
                    }
                    [resource] => {
                        rule.resources.push(key_component(block_line, "resource", resource)?);
                    }
                    [keyword, cidr] if keyword == WHITELIST => {
                        rule.whitelist.push(parse_cidr(block_line, cidr)?);
                    }
                    [keyword, _] => {
                        return Err(TurnstileError::syntax(
                            block_line,
                            format!("expecting {}, got {}", WHITELIST, keyword),
                        ));
                    }
                    tokens => {
                        return Err(TurnstileError::syntax(
                            block_line,
                            format!("wrong argument count: expected 1 or 2, got {}", tokens.len()),
                        ));
                    }
                }
            }

            if !closed {
                return Err(TurnstileError::syntax(line, "unterminated block, missing '}'"));
            }
        }

        rules.push(rule);
    }

    Ok(rules)
}

/// Build a rule from the arguments following the directive name.
fn parse_directive(line: usize, args: &[String]) -> Result<RateRule> {
    match args {
        [methods, rate, burst, unit] => Ok(RateRule::new(
            key_component(line, "methods", methods)?,
            parse_int(line, "rate", rate)?,
            parse_int(line, "burst", burst)?,
            unit.as_str(),
        )),
        [methods, resource, rate, burst, unit] => Ok(RateRule::new(
            key_component(line, "methods", methods)?,
            parse_int(line, "rate", rate)?,
            parse_int(line, "burst", burst)?,
            unit.as_str(),
        )
        .with_resource(key_component(line, "resource", resource)?)),
        _ => Err(TurnstileError::syntax(
            line,
            format!("wrong argument count: expected 4 or 5, got {}", args.len()),
        )),
    }
}

/// Methods and resources end up in limiter keys, so they may not contain the
/// key separator.
fn key_component(line: usize, field: &str, token: &str) -> Result<String> {
    if token.contains(KEY_SEPARATOR) {
        return Err(TurnstileError::syntax(
            line,
            format!("{} '{}' may not contain '{}'", field, token, KEY_SEPARATOR),
        ));
    }
    Ok(token.to_string())
}

fn parse_int(line: usize, field: &str, token: &str) -> Result<i64> {
    token
        .parse()
        .map_err(|e| TurnstileError::syntax(line, format!("invalid {} '{}': {}", field, token, e)))
}

fn parse_cidr(line: usize, token: &str) -> Result<IpNet> {
    token
        .parse()
        .map_err(|e| TurnstileError::syntax(line, format!("invalid CIDR '{}': {}", token, e)))
}

/// Split a line into tokens.
///
/// Whitespace separates tokens, double quotes group them (with `\` escaping
/// the next character) and a `#` at the start of a token comments out the
/// rest of the line.
fn tokenize(line: usize, text: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '#' {
            break;
        }

        let mut token = String::new();
        if c == '"' {
            chars.next();
            let mut terminated = false;
            while let Some(c) = chars.next() {
                match c {
                    '"' => {
                        terminated = true;
                        break;
                    }
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            token.push(escaped);
                        }
                    }
                    c => token.push(c),
                }
            }
            if !terminated {
                return Err(TurnstileError::syntax(line, "unterminated quoted string"));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}
