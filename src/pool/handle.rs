use crate::driver::Database;
use crate::domain::DbDomain;

use super::{Error, PoolClass};

/// Topology role a handle's owning server plays at the time the handle was
/// opened. Kept on the handle (not re-derived) so a handle opened against a
/// replica that is later promoted still reports its original role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Writer,
    Replica,
    Static,
}

/// A single live connection plus the bookkeeping the balancer needs to
/// reuse, switch, and invalidate it. At most one pool contains a handle at
/// a time; pool class is immutable for the handle's lifetime.
pub struct Handle {
    id: u64,
    server_index: usize,
    class: PoolClass,
    role: Role,
    conn: Box<dyn Database>,
    /// Set while the handle is a round participant; cleared on undo.
    round_id: Option<String>,
    /// Remembers the handle's autocommit flag from before round
    /// participation toggled it on, so undo can restore it.
    prior_autocommit: Option<bool>,
}

impl Handle {
    pub(crate) fn new(id: u64, server_index: usize, class: PoolClass, role: Role, conn: Box<dyn Database>) -> Self {
        Self {
            id,
            server_index,
            class,
            role,
            conn,
            round_id: None,
            prior_autocommit: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server_index(&self) -> usize {
        self.server_index
    }

    pub fn class(&self) -> PoolClass {
        self.class
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn round_id(&self) -> Option<&str> {
        self.round_id.as_deref()
    }

    pub fn conn(&self) -> &dyn Database {
        self.conn.as_ref()
    }

    pub fn conn_mut(&mut self) -> &mut dyn Database {
        self.conn.as_mut()
    }

    /// A handle is shareable across a domain switch unless the driver
    /// reports that databases are independent and the target dbname
    /// differs from the handle's current dbname.
    pub(super) fn shareable_for(&self, domain: &DbDomain) -> bool {
        if !self.conn.databases_are_independent() {
            return true;
        }
        self.conn.current_domain().database == domain.database
    }

    pub(super) async fn switch_domain(&mut self, domain: &DbDomain) -> Result<(), Error> {
        if self.conn.current_domain() == domain {
            return Ok(());
        }
        self.conn.switch_domain(domain).await?;
        if self.conn.current_domain() != domain {
            return Err(Error::DomainMismatch {
                actual: self.conn.current_domain().canonical_id(),
                requested: domain.canonical_id(),
            });
        }
        Ok(())
    }

    /// A writer handle whose configured flags include "default trx mode"
    /// but is currently in auto-commit is toggled into transactional mode
    /// with prior flags remembered, and tagged with the current round id.
    /// Handles whose pool class is autocommit are never touched -- this is
    /// enforced by the caller only invoking this on `PoolClass::Round`
    /// writer handles.
    pub(super) fn apply_round_flags(&mut self, round_id: Option<&str>) {
        if self.conn.is_autocommit() {
            self.prior_autocommit = Some(true);
            self.conn.set_autocommit(false);
        }
        self.round_id = round_id.map(|s| s.to_string());
    }

    /// Undo restores prior flags and clears the round id.
    pub fn undo_round_flags(&mut self) {
        if let Some(prior) = self.prior_autocommit.take() {
            self.conn.set_autocommit(prior);
        }
        self.round_id = None;
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("server_index", &self.server_index)
            .field("class", &self.class)
            .field("round_id", &self.round_id)
            .finish()
    }
}

/// The invalidation contract held by application code's lightweight
/// connection reference. Deliberately thin: only the contract between the
/// balancer and this reference is designed here, not the reference's full
/// API surface (out of scope, owned by the thin wrapper handle application
/// code actually holds). A reference carries the modcount it was handed out
/// with; a reference whose counter is stale must be re-resolved against the
/// pool on next use rather than dereferenced directly.
#[derive(Debug, Clone, Copy)]
pub struct HandleRef {
    pub handle_id: u64,
    pub server_index: usize,
    pub class: PoolClass,
    pub modcount_at_acquire: u64,
}

impl HandleRef {
    pub fn new(handle: &Handle, modcount: u64) -> Self {
        Self {
            handle_id: handle.id(),
            server_index: handle.server_index(),
            class: handle.class(),
            modcount_at_acquire: modcount,
        }
    }

    /// `true` if this reference must be re-resolved before use because a
    /// removing reconfiguration happened since it was handed out.
    pub fn is_stale(&self, current_modcount: u64) -> bool {
        current_modcount != self.modcount_at_acquire
    }
}
