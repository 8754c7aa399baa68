//! Permission grants a vault holds, and the checks performed against them.
//!
//! HTTP vaults and writable local vaults are fully permitted. Remote (MySQL)
//! vaults derive their grants from `SHOW GRANTS`, which returns free-form
//! lines such as:
//!
//! ```text
//! GRANT SELECT, INSERT ON `keys`.`netflix` TO `bot`@`%`
//! GRANT ALL PRIVILEGES ON *.* TO `root`@`localhost` WITH GRANT OPTION
//! ```
//!
//! All of that string scraping stays in this module.

use crate::error::{Result, VaultError};

/// Matches any operation, database or table.
pub const WILDCARD: &str = "*";

/// One grant: a set of operations over a `database.table` scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionGrant {
    operations: Vec<String>,
    database: String,
    table: String,
}

impl PermissionGrant {
    pub fn new<I, S>(operations: I, database: &str, table: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        PermissionGrant {
            operations: operations
                .into_iter()
                .map(|op| op.as_ref().trim().to_uppercase())
                .filter(|op| !op.is_empty())
                .collect(),
            database: database.to_string(),
            table: table.to_string(),
        }
    }

    /// `(["*"], ("*", "*"))`
    pub fn full_access() -> Self {
        Self::new([WILDCARD], WILDCARD, WILDCARD)
    }

    /// Parse one `SHOW GRANTS` line.
    ///
    /// Returns `Ok(None)` for lines that carry no object privileges: role
    /// membership (`GRANT role TO user`) and account-scoped grants such as
    /// `GRANT PROXY ON ''@'' TO user`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let malformed = || VaultError::Backend(format!("Unrecognised grant: {line}"));

        let line = line.trim();
        let body = line
            .get(..6)
            .filter(|prefix| prefix.eq_ignore_ascii_case("GRANT "))
            .map(|_| &line[6..])
            .ok_or_else(malformed)?;
        let (privileges, _grantee) = body.split_once(" TO ").ok_or_else(malformed)?;
        let Some((operations, location)) = privileges.split_once(" ON ") else {
            return Ok(None);
        };

        let location: String = location
            .trim()
            .chars()
            .filter(|c| !matches!(c, '`' | '\'' | '"'))
            .collect();
        // `ON PROCEDURE db.proc` and friends
        let location = location.rsplit(' ').next().unwrap_or_default();
        let Some((database, table)) = location.split_once('.') else {
            if location.contains('@') {
                return Ok(None);
            }
            return Err(malformed());
        };
        if database.is_empty() || table.is_empty() {
            return Err(malformed());
        }

        let operations = split_operations(&operations.replace("ALL PRIVILEGES", WILDCARD));
        if operations.is_empty() {
            return Err(malformed());
        }

        Ok(Some(Self::new(operations, database, table)))
    }

    pub fn operations(&self) -> &[String] {
        &self.operations
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn allows(&self, operation: &str) -> bool {
        self.operations
            .iter()
            .any(|op| op == WILDCARD || op.eq_ignore_ascii_case(operation))
    }
}

/// Split `SELECT (a, b), INSERT` on top-level commas, dropping column lists.
fn split_operations(raw: &str) -> Vec<String> {
    let mut operations = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in raw.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => operations.push(std::mem::take(&mut current)),
            _ if depth == 0 => current.push(c),
            _ => {}
        }
    }
    operations.push(current);
    operations
        .into_iter()
        .map(|op| op.trim().to_string())
        .filter(|op| !op.is_empty())
        .collect()
}

/// The immutable grant set loaded for one vault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    grants: Vec<PermissionGrant>,
}

impl Permissions {
    pub fn new(grants: Vec<PermissionGrant>) -> Self {
        Permissions { grants }
    }

    pub fn full_access() -> Self {
        Self::new(vec![PermissionGrant::full_access()])
    }

    pub fn read_only() -> Self {
        Self::new(vec![PermissionGrant::new(["SELECT"], WILDCARD, WILDCARD)])
    }

    /// Build from the raw lines of a `SHOW GRANTS` result.
    pub fn from_grant_lines<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut grants = Vec::new();
        for line in lines {
            if let Some(grant) = PermissionGrant::parse(line.as_ref())? {
                grants.push(grant);
            }
        }
        Ok(Self::new(grants))
    }

    pub fn grants(&self) -> &[PermissionGrant] {
        &self.grants
    }

    /// Whether any grant allows `operation`, optionally narrowed to a
    /// database and/or table (each matching exactly or through `*`).
    pub fn has(&self, operation: &str, database: Option<&str>, table: Option<&str>) -> bool {
        self.grants
            .iter()
            .filter(|grant| grant.allows(operation))
            .filter(|grant| database.map_or(true, |db| grant.database == db || grant.database == WILDCARD))
            .any(|grant| table.map_or(true, |t| grant.table == t || grant.table == WILDCARD))
    }
}
