//! Stub store - ordered stub table with first-match lookup.

use crate::matcher;
use crate::stub::{self, Fields, Mode, NotFound, Output, Query, Stub, StubError};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// `service -> method -> stubs`, stubs in insertion order.
pub type StubTable = BTreeMap<String, BTreeMap<String, Vec<Stub>>>;

/// All stubs, behind one lock.
#[derive(Debug, Default)]
pub struct StubStore {
    stubs: Mutex<StubTable>,
}

impl StubStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, StubTable> {
        self.stubs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate and append one stub.
    pub fn add(&self, stub: Stub) -> Result<(), StubError> {
        let stub = stub.validate()?;
        debug!(service = %stub.service, method = %stub.method, "Added stub");
        push(&mut self.table(), stub);
        Ok(())
    }

    /// Validate every stub first; store all of them or none.
    pub fn add_many(&self, stubs: Vec<Stub>) -> Result<usize, StubError> {
        let stubs = stubs
            .into_iter()
            .map(Stub::validate)
            .collect::<Result<Vec<_>, _>>()?;
        let count = stubs.len();
        let mut table = self.table();
        for stub in stubs {
            push(&mut table, stub);
        }
        Ok(count)
    }

    /// Return the output of the first stub matching `query`.
    pub fn find(&self, query: &Query) -> Result<Output, StubError> {
        let method = stub::title_case(&query.method);
        let table = self.table();

        let stubs = lookup(&table, &query.service, &method);
        let mut candidates: Vec<(Mode, &Fields)> = Vec::new();
        for stub in stubs {
            for (mode, rule) in stub.input.rules.iter() {
                candidates.push((mode, rule));
                if !matcher::matches(mode, rule, &query.data) {
                    continue;
                }
                let headers_ok = stub
                    .input
                    .headers
                    .as_ref()
                    .is_none_or(|rules| matcher::headers_match(rules, &query.headers));
                if headers_ok {
                    return Ok(stub.output.clone());
                }
            }
        }

        let input = matcher::render_fields(&query.data);
        let closest = matcher::closest(&input, candidates.iter().map(|(_, rule)| *rule))
            .map(|i| (candidates[i].0, matcher::render_fields(candidates[i].1)));
        debug!(service = %query.service, method = %method, tried = candidates.len(), "No stub matched");
        Err(StubError::NotFound(NotFound {
            service: query.service.clone(),
            method,
            input: format!("Data:\n{input}"),
            closest,
        }))
    }

    pub fn clear(&self) {
        self.table().clear();
    }

    /// Copy of the whole table.
    pub fn all(&self) -> StubTable {
        self.table().clone()
    }

    /// Number of stored stubs
    pub fn len(&self) -> usize {
        self.table()
            .values()
            .flat_map(|methods| methods.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load every stub file under `dir`; returns the number of stubs added.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let stubs = stub::read_stub_dir(dir)?;
        let count = self.add_many(stubs)?;
        info!(path = %dir.display(), count, "Loaded stubs");
        Ok(count)
    }

    /// Replace the table with the stubs under `dir`, or empty it if none.
    ///
    /// The directory is read and validated before the swap; on error the
    /// current stubs stay in place.
    pub fn reset(&self, dir: Option<&Path>) -> Result<usize> {
        let stubs = match dir {
            Some(dir) => stub::read_stub_dir(dir)?
                .into_iter()
                .map(Stub::validate)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let count = stubs.len();
        let mut fresh = StubTable::new();
        for stub in stubs {
            push(&mut fresh, stub);
        }
        *self.table() = fresh;
        info!(count, "Reset stubs");
        Ok(count)
    }
}

fn push(table: &mut StubTable, stub: Stub) {
    table
        .entry(stub.service.clone())
        .or_default()
        .entry(stub.method.clone())
        .or_default()
        .push(stub);
}

/// Stubs for a method, in match order.
///
/// A qualified service name (`pkg.Service`) also sees stubs stored under
/// its short name, after its own.
fn lookup<'a>(table: &'a StubTable, service: &str, method: &str) -> impl Iterator<Item = &'a Stub> {
    let short = service
        .rsplit_once('.')
        .map(|(_, short)| short)
        .filter(|short| !short.is_empty());
    let by_name = move |name: &str| {
        table
            .get(name)
            .and_then(|methods| methods.get(method))
            .into_iter()
            .flatten()
    };
    by_name(service).chain(short.into_iter().flat_map(by_name))
}
