//! Fault injection points for tests. A failpoint is enabled either for
//! the current thread or process-wide through the `GRANITE_FAILPOINTS`
//! environment variable (comma-separated names).

use std::cell::RefCell;
use std::collections::HashSet;

use crate::error::{Result, StorageError};

thread_local! {
    static FAILPOINTS: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

pub fn enable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
}

pub fn disable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().remove(name);
    });
}

pub fn clear() {
    FAILPOINTS.with(|set| {
        set.borrow_mut().clear();
    });
}

pub fn is_enabled(name: &str) -> bool {
    let local_enabled = FAILPOINTS.with(|set| set.borrow().contains(name));
    if local_enabled {
        return true;
    }

    std::env::var("GRANITE_FAILPOINTS")
        .ok()
        .map(|raw| raw.split(',').any(|v| v.trim() == name))
        .unwrap_or(false)
}

pub fn maybe_fail(name: &str) -> Result<()> {
    if is_enabled(name) {
        Err(StorageError::io(
            format!("failpoint {name}"),
            std::io::Error::other(format!("failpoint triggered: {name}")),
        ))
    } else {
        Ok(())
    }
}
