//! DDL statement parser for the in-process engine
//!
//! Understands the subset of PostgreSQL DDL that tenant migrations use:
//! CREATE/DROP TABLE, ALTER TABLE (ADD/DROP/RENAME COLUMN, RENAME TO),
//! CREATE/DROP INDEX and `SELECT pg_sleep(n)`. Anything else that does not
//! start with CREATE TABLE/INDEX, ALTER TABLE or DROP TABLE/INDEX is accepted
//! as data manipulation and has no schema effect.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum DdlStatement {
    CreateTable {
        name: String,
        if_not_exists: bool,
        columns: Vec<String>,
        primary_key: bool,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    AlterTable {
        name: String,
        if_exists: bool,
        actions: Vec<AlterAction>,
    },
    CreateIndex {
        name: String,
        table: String,
        if_not_exists: bool,
    },
    DropIndex {
        name: String,
        if_exists: bool,
    },
    Sleep(Duration),
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlterAction {
    AddColumn { column: String, if_not_exists: bool },
    DropColumn { column: String, if_exists: bool },
    RenameColumn { from: String, to: String },
    RenameTable { to: String },
    Other,
}

macro_rules! regex {
    ($pattern:expr) => {{
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new($pattern).expect("static regex"))
    }};
}

/// Parse a whole migration script into statements
pub fn parse_script(sql: &str) -> Result<Vec<DdlStatement>, String> {
    let sql = strip_comments(sql);

    split_top_level(&sql, ';')
        .iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_statement(s.trim()))
        .collect()
}

/// Remove `--` and `/* */` comments that sit outside quotes and `$$` bodies
fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_quote = false;
    let mut in_dollar = false;
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '$' if !in_quote && chars.peek() == Some(&'$') => {
                chars.next();
                in_dollar = !in_dollar;
                out.push_str("$$");
            }
            '\'' if !in_dollar => {
                in_quote = !in_quote;
                out.push(ch);
            }
            '-' if !in_quote && !in_dollar && chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if !in_quote && !in_dollar && chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
            }
            _ => out.push(ch),
        }
    }

    out
}

/// Split on `sep` outside parentheses, single quotes and `$$` bodies
fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut in_dollar = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '$' if !in_quote && chars.peek() == Some(&'$') => {
                chars.next();
                in_dollar = !in_dollar;
                current.push_str("$$");
            }
            '\'' if !in_dollar => {
                in_quote = !in_quote;
                current.push(ch);
            }
            '(' if !in_quote && !in_dollar => {
                depth += 1;
                current.push(ch);
            }
            ')' if !in_quote && !in_dollar => {
                depth -= 1;
                current.push(ch);
            }
            c if c == sep && depth == 0 && !in_quote && !in_dollar => {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }

    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }

    parts
}

fn parse_statement(stmt: &str) -> Result<DdlStatement, String> {
    let head: Vec<String> = stmt
        .split_whitespace()
        .take(3)
        .map(|w| w.to_uppercase())
        .collect();
    let head: Vec<&str> = head.iter().map(String::as_str).collect();

    match head.as_slice() {
        ["CREATE", "TABLE", ..] => parse_create_table(stmt),
        ["CREATE", "INDEX", ..] | ["CREATE", "UNIQUE", "INDEX"] => parse_create_index(stmt),
        ["DROP", "TABLE", ..] => parse_drop(stmt, "TABLE").map(|(name, if_exists)| {
            DdlStatement::DropTable { name, if_exists }
        }),
        ["DROP", "INDEX", ..] => parse_drop(stmt, "INDEX").map(|(name, if_exists)| {
            DdlStatement::DropIndex { name, if_exists }
        }),
        ["ALTER", "TABLE", ..] => parse_alter_table(stmt),
        ["SELECT", ..] => Ok(parse_sleep(stmt).unwrap_or(DdlStatement::Other)),
        _ => Ok(DdlStatement::Other),
    }
}

fn parse_create_table(stmt: &str) -> Result<DdlStatement, String> {
    let caps = regex!(
        r#"(?is)^CREATE\s+TABLE\s+(IF\s+NOT\s+EXISTS\s+)?(?:\w+\.)?"?(\w+)"?\s*\((.*)\)\s*$"#
    )
    .captures(stmt)
    .ok_or_else(|| format!("syntax error in CREATE TABLE: {}", first_line(stmt)))?;

    let name = caps[2].to_lowercase();
    let mut columns = Vec::new();
    let mut primary_key = false;

    for part in split_top_level(&caps[3], ',') {
        let upper = part.to_uppercase();

        if upper.starts_with("PRIMARY KEY")
            || (upper.starts_with("CONSTRAINT") && upper.contains("PRIMARY KEY"))
        {
            primary_key = true;
            continue;
        }
        if ["CONSTRAINT", "FOREIGN", "CHECK", "UNIQUE", "EXCLUDE", "LIKE"]
            .iter()
            .any(|kw| upper.starts_with(kw))
        {
            continue;
        }

        let col = regex!(r#"^"?(\w+)"?\s+\S"#)
            .captures(&part)
            .ok_or_else(|| format!("cannot parse column definition in {}: {}", name, part))?;

        if upper.contains("PRIMARY KEY") {
            primary_key = true;
        }
        columns.push(col[1].to_lowercase());
    }

    Ok(DdlStatement::CreateTable {
        name,
        if_not_exists: caps.get(1).is_some(),
        columns,
        primary_key,
    })
}

fn parse_create_index(stmt: &str) -> Result<DdlStatement, String> {
    let caps = regex!(
        r#"(?is)^CREATE\s+(?:UNIQUE\s+)?INDEX\s+(?:CONCURRENTLY\s+)?(IF\s+NOT\s+EXISTS\s+)?"?(\w+)"?\s+ON\s+(?:ONLY\s+)?(?:\w+\.)?"?(\w+)"?"#
    )
    .captures(stmt)
    .ok_or_else(|| format!("CREATE INDEX requires an explicit index name: {}", first_line(stmt)))?;

    Ok(DdlStatement::CreateIndex {
        name: caps[2].to_lowercase(),
        table: caps[3].to_lowercase(),
        if_not_exists: caps.get(1).is_some(),
    })
}

fn parse_drop(stmt: &str, kind: &str) -> Result<(String, bool), String> {
    let re = match kind {
        "TABLE" => regex!(r#"(?is)^DROP\s+TABLE\s+(IF\s+EXISTS\s+)?(?:\w+\.)?"?(\w+)"?\s*(?:CASCADE|RESTRICT)?\s*$"#),
        _ => regex!(r#"(?is)^DROP\s+INDEX\s+(?:CONCURRENTLY\s+)?(IF\s+EXISTS\s+)?(?:\w+\.)?"?(\w+)"?\s*(?:CASCADE|RESTRICT)?\s*$"#),
    };

    let caps = re
        .captures(stmt)
        .ok_or_else(|| format!("syntax error in DROP {}: {}", kind, first_line(stmt)))?;

    Ok((caps[2].to_lowercase(), caps.get(1).is_some()))
}

fn parse_alter_table(stmt: &str) -> Result<DdlStatement, String> {
    let caps = regex!(
        r#"(?is)^ALTER\s+TABLE\s+(IF\s+EXISTS\s+)?(?:ONLY\s+)?(?:\w+\.)?"?(\w+)"?\s+(.+)$"#
    )
    .captures(stmt)
    .ok_or_else(|| format!("syntax error in ALTER TABLE: {}", first_line(stmt)))?;

    let name = caps[2].to_lowercase();
    let actions = split_top_level(&caps[3], ',')
        .iter()
        .map(|a| parse_alter_action(a))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DdlStatement::AlterTable {
        name,
        if_exists: caps.get(1).is_some(),
        actions,
    })
}

fn parse_alter_action(action: &str) -> Result<AlterAction, String> {
    let upper = action.to_uppercase();

    if regex!(r"(?i)^ADD\s+(CONSTRAINT|PRIMARY|UNIQUE|FOREIGN|CHECK|EXCLUDE)\b").is_match(action)
        || regex!(r"(?i)^DROP\s+CONSTRAINT\b").is_match(action)
    {
        return Ok(AlterAction::Other);
    }

    if upper.starts_with("ADD") {
        let caps = regex!(r#"(?is)^ADD\s+(?:COLUMN\s+)?(IF\s+NOT\s+EXISTS\s+)?"?(\w+)"?\s+\S"#)
            .captures(action)
            .ok_or_else(|| format!("syntax error in ADD COLUMN: {}", action))?;
        return Ok(AlterAction::AddColumn {
            column: caps[2].to_lowercase(),
            if_not_exists: caps.get(1).is_some(),
        });
    }

    if upper.starts_with("DROP") {
        let caps = regex!(r#"(?is)^DROP\s+(?:COLUMN\s+)?(IF\s+EXISTS\s+)?"?(\w+)"?"#)
            .captures(action)
            .ok_or_else(|| format!("syntax error in DROP COLUMN: {}", action))?;
        return Ok(AlterAction::DropColumn {
            column: caps[2].to_lowercase(),
            if_exists: caps.get(1).is_some(),
        });
    }

    if let Some(caps) =
        regex!(r#"(?is)^RENAME\s+(?:COLUMN\s+)?"?(\w+)"?\s+TO\s+"?(\w+)"?\s*$"#).captures(action)
    {
        if caps[1].eq_ignore_ascii_case("to") {
            return Err(format!("syntax error in RENAME: {}", action));
        }
        return Ok(AlterAction::RenameColumn {
            from: caps[1].to_lowercase(),
            to: caps[2].to_lowercase(),
        });
    }

    if let Some(caps) = regex!(r#"(?is)^RENAME\s+TO\s+"?(\w+)"?\s*$"#).captures(action) {
        return Ok(AlterAction::RenameTable {
            to: caps[1].to_lowercase(),
        });
    }

    Ok(AlterAction::Other)
}

fn parse_sleep(stmt: &str) -> Option<DdlStatement> {
    let caps = regex!(r"(?i)^SELECT\s+pg_sleep\(\s*([0-9]*\.?[0-9]+)\s*\)\s*$").captures(stmt)?;
    let secs: f64 = caps[1].parse().ok()?;
    Some(DdlStatement::Sleep(Duration::try_from_secs_f64(secs).ok()?))
}

fn first_line(stmt: &str) -> &str {
    stmt.lines().next().unwrap_or(stmt).trim()
}
