// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Application process names
//!
//! Every application and IPC process is identified by a four-component
//! name: application process name, application process instance,
//! application entity name and application entity instance. Equality is
//! plain lexicographic comparison of the four components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A four-component application process name.
///
/// The canonical string form joins the components with `/`, omitting
/// trailing empty components: `"server/1//"` and `"server/1"` parse to the
/// same name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApplName {
    /// Application process name
    pub apn: String,
    /// Application process instance
    pub api: String,
    /// Application entity name
    pub aen: String,
    /// Application entity instance
    pub aei: String,
}

impl ApplName {
    pub fn new(apn: &str, api: &str, aen: &str, aei: &str) -> Self {
        Self {
            apn: apn.to_string(),
            api: api.to_string(),
            aen: aen.to_string(),
            aei: aei.to_string(),
        }
    }

    /// Shorthand for names that only use the process component.
    pub fn from_apn(apn: &str) -> Self {
        Self::new(apn, "", "", "")
    }

    pub fn is_empty(&self) -> bool {
        self.apn.is_empty() && self.api.is_empty() && self.aen.is_empty() && self.aei.is_empty()
    }

    /// The four components in serialization order.
    pub fn components(&self) -> [&str; 4] {
        [&self.apn, &self.api, &self.aen, &self.aei]
    }
}

impl fmt::Display for ApplName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![self.apn.as_str()];
        // Keep intermediate empties so the string parses back unambiguously.
        let tail = [&self.api, &self.aen, &self.aei];
        let last = tail.iter().rposition(|c| !c.is_empty());
        if let Some(last) = last {
            for c in &tail[..=last] {
                parts.push(c.as_str());
            }
        }
        write!(f, "{}", parts.join("/"))
    }
}

impl FromStr for ApplName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidArgument("empty application name".to_string()));
        }
        let mut it = s.split('/');
        let apn = it.next().unwrap_or("").to_string();
        let api = it.next().unwrap_or("").to_string();
        let aen = it.next().unwrap_or("").to_string();
        let aei = it.next().unwrap_or("").to_string();
        if it.next().is_some() {
            return Err(Error::InvalidArgument(format!(
                "application name '{}' has more than four components",
                s
            )));
        }
        Ok(Self { apn, api, aen, aei })
    }
}
