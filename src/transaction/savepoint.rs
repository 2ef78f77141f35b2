/// Savepoint name for a scope at `depth` (the root transaction is depth 1).
///
/// Siblings at the same depth never overlap in time: one is released or
/// rolled back before the next is created, so the depth alone is unique
/// among live savepoints.
#[must_use]
pub fn savepoint_name(depth: usize) -> String {
    format!("sp_coord_{depth}")
}

pub(super) fn create_sql(name: &str) -> String {
    format!("SAVEPOINT {name}")
}

pub(super) fn release_sql(name: &str) -> String {
    format!("RELEASE {name}")
}

/// `ROLLBACK TO` keeps the savepoint on the stack; release it too so the
/// name is free for the next sibling.
pub(super) fn rollback_to_sql(name: &str) -> String {
    format!("ROLLBACK TO {name}; RELEASE {name}")
}
