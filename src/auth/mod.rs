//! htpasswd-style user and group files.
//!
//! The gateway does not manage accounts itself: operators point it at a
//! password file with one `user:md5hex` entry per line and, optionally, a
//! group file with `group: member member…` lines. The loader turns the pair
//! into the manager's access-check callback. Group membership gates database
//! access by name: when a group named after the database exists, only its
//! members may open it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use md5::{Digest, Md5};

use crate::dbmgr::FnCheckAccess;
use crate::errors::Error;

pub fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// Parsed `user:md5hex` password file. Lines starting with `#` and blank
/// lines are skipped.
#[derive(Debug, Clone, Default)]
pub struct UserFile {
    users: HashMap<String, String>,
}

impl UserFile {
    pub fn load(path: &Path) -> Result<UserFile, Error> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::BadConfig(format!("cannot read user file {}: {err}", path.display()))
        })?;
        let mut users = HashMap::new();
        for (number, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, digest)) = line.split_once(':') else {
                return Err(Error::BadConfig(format!(
                    "user file {}: line {} is not user:digest",
                    path.display(),
                    number + 1
                )));
            };
            users.insert(user.trim().to_string(), digest.trim().to_ascii_lowercase());
        }
        Ok(UserFile { users })
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        self.users
            .get(user)
            .map(|digest| *digest == md5_hex(password))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Parsed `group: member member…` group file.
#[derive(Debug, Clone, Default)]
pub struct GroupFile {
    groups: HashMap<String, Vec<String>>,
}

impl GroupFile {
    pub fn load(path: &Path) -> Result<GroupFile, Error> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::BadConfig(format!("cannot read group file {}: {err}", path.display()))
        })?;
        let mut groups = HashMap::new();
        for (number, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((group, members)) = line.split_once(':') else {
                return Err(Error::BadConfig(format!(
                    "group file {}: line {} is not group: members",
                    path.display(),
                    number + 1
                )));
            };
            groups.insert(
                group.trim().to_string(),
                members
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            );
        }
        Ok(GroupFile { groups })
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn member_of(&self, user: &str, group: &str) -> bool {
        self.groups
            .get(group)
            .map(|members| members.iter().any(|member| member == user))
            .unwrap_or(false)
    }
}

/// Build the manager's access-check callback from the loaded files.
pub fn access_checker(users: UserFile, groups: Option<GroupFile>) -> FnCheckAccess {
    Arc::new(move |user: &str, password: &str, database: &str| {
        if !users.verify(user, password) {
            return Ok(false);
        }
        if let Some(groups) = &groups {
            if groups.has_group(database) && !groups.member_of(user, database) {
                return Ok(false);
            }
        }
        Ok(true)
    })
}
