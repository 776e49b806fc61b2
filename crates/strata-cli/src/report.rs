use strata_common::Error;
use strata_db::{Catalog, normalize};

/// Map a failure to the process exit code.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    let Some(err) = err.downcast_ref::<Error>() else {
        return 1;
    };
    match err {
        Error::Discovery(_) | Error::InvalidConfig(_) | Error::Config(_) => 2,
        Error::ApplicationIdentity { .. } | Error::Consistency { .. } | Error::Drift { .. } => 3,
        Error::NestedTransaction { .. } => 4,
        Error::Cancelled => 130,
        Error::Execution { .. } | Error::Connection(_) | Error::Metadata(_) | Error::Io(_) => 1,
    }
}

pub fn print_error(err: &anyhow::Error) {
    eprintln!("error: {err}");
    for cause in err.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
    if let Some(hint) = err.downcast_ref::<Error>().and_then(hint) {
        eprintln!("hint: {hint}");
    }
}

fn hint(err: &Error) -> Option<&'static str> {
    match err {
        Error::Drift { .. } => Some(
            "applied migrations must not change; add a new migration instead, \
             or run mark-applied after repairing the database by hand",
        ),
        Error::Consistency { .. } => Some("restore the deleted migration file"),
        Error::NestedTransaction { .. } => Some(
            "remove BEGIN/COMMIT from the migration; every run already executes in one transaction",
        ),
        Error::Cancelled => Some("the transaction was rolled back; nothing was recorded"),
        _ => None,
    }
}

/// On drift, print the canonical text the computed hash was taken from.
pub fn print_drift_detail(err: &Error, catalog: &Catalog) {
    let Error::Drift { id, .. } = err else {
        return;
    };
    if let Some(entry) = catalog.get(id) {
        eprintln!("normalized {id}:");
        eprintln!("{}", normalize(entry.statement()));
    }
}
