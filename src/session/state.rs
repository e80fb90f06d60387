use std::collections::HashMap;

use crate::protocol::response::SessionStateChange;

/// Transaction isolation level mirrored from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    #[default]
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn from_server_value(value: &str) -> Option<Self> {
        match value.replace('_', "-").to_ascii_uppercase().as_str() {
            "READ-UNCOMMITTED" => Some(IsolationLevel::ReadUncommitted),
            "READ-COMMITTED" => Some(IsolationLevel::ReadCommitted),
            "REPEATABLE-READ" => Some(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Local mirror of server-side session state.
///
/// Updated exclusively through `apply_delta` with the state-track entries of
/// each command response; a drift between this mirror and the actual server
/// state is a correctness bug.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Current default schema (catalog)
    pub catalog: Option<String>,
    pub autocommit: bool,
    pub isolation: IsolationLevel,
    pub in_transaction: bool,
    /// Tracked system variables as reported by the server
    system_variables: HashMap<String, String>,
    /// Redirect target announced during authentication, if any
    pub redirect_url: Option<String>,
}

impl SessionState {
    pub fn new(catalog: Option<String>) -> Self {
        Self {
            catalog,
            autocommit: true,
            ..Default::default()
        }
    }

    /// Apply a batch of server-notified state changes. This is the only
    /// place mirror fields are written from command responses.
    pub fn apply_delta(&mut self, changes: &[SessionStateChange]) {
        for change in changes {
            match change {
                SessionStateChange::Schema(schema) => {
                    self.catalog = Some(schema.clone());
                }
                SessionStateChange::SystemVariable { name, value } => {
                    match name.to_ascii_lowercase().as_str() {
                        "autocommit" => {
                            self.autocommit = value.eq_ignore_ascii_case("ON")
                                || value == "1"
                        }
                        "transaction_isolation" | "tx_isolation" => {
                            if let Some(level) = IsolationLevel::from_server_value(value) {
                                self.isolation = level;
                            }
                        }
                        "redirect_url" => {
                            if !value.is_empty() {
                                self.redirect_url = Some(value.clone());
                            }
                        }
                        _ => {}
                    }
                    self.system_variables
                        .insert(name.to_ascii_lowercase(), value.clone());
                }
                SessionStateChange::StateChange | SessionStateChange::Other { .. } => {}
            }
        }
    }

    /// Update the transaction/autocommit bits carried on every OK packet's
    /// status flags.
    pub fn apply_status(&mut self, in_transaction: bool, autocommit: bool) {
        self.in_transaction = in_transaction;
        self.autocommit = autocommit;
    }

    pub fn system_variable(&self, name: &str) -> Option<&str> {
        self.system_variables
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Consume a pending redirect announcement.
    pub fn take_redirect(&mut self) -> Option<String> {
        self.redirect_url.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_delta_updates_catalog() {
        let mut state = SessionState::new(Some("orders".to_string()));
        state.apply_delta(&[SessionStateChange::Schema("archive".to_string())]);
        assert_eq!(state.catalog.as_deref(), Some("archive"));
    }

    #[test]
    fn autocommit_delta() {
        let mut state = SessionState::new(None);
        assert!(state.autocommit);
        state.apply_delta(&[SessionStateChange::SystemVariable {
            name: "autocommit".to_string(),
            value: "OFF".to_string(),
        }]);
        assert!(!state.autocommit);
        assert_eq!(state.system_variable("autocommit"), Some("OFF"));
    }

    #[test]
    fn isolation_delta() {
        let mut state = SessionState::new(None);
        state.apply_delta(&[SessionStateChange::SystemVariable {
            name: "transaction_isolation".to_string(),
            value: "SERIALIZABLE".to_string(),
        }]);
        assert_eq!(state.isolation, IsolationLevel::Serializable);
    }

    #[test]
    fn redirect_is_consumed_once() {
        let mut state = SessionState::new(None);
        state.apply_delta(&[SessionStateChange::SystemVariable {
            name: "redirect_url".to_string(),
            value: "mysql://other:3307".to_string(),
        }]);
        assert_eq!(state.take_redirect().as_deref(), Some("mysql://other:3307"));
        assert!(state.take_redirect().is_none());
    }

    #[test]
    fn isolation_level_parse() {
        assert_eq!(
            IsolationLevel::from_server_value("READ-COMMITTED"),
            Some(IsolationLevel::ReadCommitted)
        );
        assert_eq!(
            IsolationLevel::from_server_value("repeatable_read"),
            Some(IsolationLevel::RepeatableRead)
        );
        assert_eq!(IsolationLevel::from_server_value("bogus"), None);
    }
}
