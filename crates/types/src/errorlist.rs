// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::error::Error as StdError;
use std::fmt;

/// A list of errors that behaves like a single error value.
///
/// Every partial-failure surface in uplift (agent fan-out, transaction
/// rollback, bulk directory operations) returns this type so that no inner
/// failure is ever dropped. Insertion order is preserved, and
/// [`ErrorList::contains`] walks the source chain of every contained error,
/// so a caller can still ask "did host X fail with permission denied?" after
/// aggregation.
///
/// Pushing an `ErrorList` into another flattens its contents. Wrap a list in
/// additional context first if flattening is not wanted.
pub struct ErrorList {
    errors: Vec<anyhow::Error>,
}

impl ErrorList {
    pub fn new() -> Self {
        ErrorList { errors: Vec::new() }
    }

    /// Combines two results into one, keeping both errors when both failed.
    /// This mirrors the `commit_or_rollback` pattern: the original error and
    /// the rollback error must both survive.
    pub fn combine(a: anyhow::Result<()>, b: anyhow::Result<()>) -> anyhow::Result<()> {
        let mut list = ErrorList::new();
        if let Err(err) = a {
            list.push(err);
        }
        if let Err(err) = b {
            list.push(err);
        }
        list.into_result()
    }

    /// Appends an error, flattening nested `ErrorList` values.
    pub fn push(&mut self, err: anyhow::Error) {
        match err.downcast::<ErrorList>() {
            Ok(inner) => self.errors.extend(inner.errors),
            Err(err) => self.errors.push(err),
        }
    }

    /// Records the error of a failed result, if any.
    pub fn extend_from(&mut self, result: anyhow::Result<()>) {
        if let Err(err) = result {
            self.push(err);
        }
    }

    /// Collapses the list following the aggregation rules:
    ///
    /// - no errors: `Ok(())`
    /// - exactly one error: that error, unchanged
    /// - otherwise: the list itself as the error
    pub fn into_result(mut self) -> anyhow::Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.pop().expect("len checked")),
            _ => Err(anyhow::Error::new(self)),
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &anyhow::Error> {
        self.errors.iter()
    }

    /// Returns true if any contained error, or anything in its source chain,
    /// is of type `E`.
    pub fn contains<E>(&self) -> bool
    where
        E: StdError + Send + Sync + 'static,
    {
        self.errors
            .iter()
            .any(|err| err.chain().any(|cause| cause.is::<E>()))
    }
}

impl Default for ErrorList {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<anyhow::Error> for ErrorList {
    fn from_iter<I: IntoIterator<Item = anyhow::Error>>(iter: I) -> Self {
        let mut list = ErrorList::new();
        for err in iter {
            list.push(err);
        }
        list
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            return write!(f, "1 error occurred:\n\t* {}", self.errors[0]);
        }

        writeln!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            writeln!(f, "\t* {err}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.errors.iter()).finish()
    }
}

impl StdError for ErrorList {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn io_err(kind: io::ErrorKind, msg: &str) -> anyhow::Error {
        anyhow::Error::new(io::Error::new(kind, msg.to_owned()))
    }

    #[test]
    fn empty_list_is_ok() {
        assert!(ErrorList::new().into_result().is_ok());
    }

    #[test]
    fn single_error_is_returned_unchanged() {
        let mut list = ErrorList::new();
        list.push(io_err(io::ErrorKind::PermissionDenied, "denied"));

        let err = list.into_result().unwrap_err();
        let io = err.downcast_ref::<io::Error>().expect("io error");
        assert_eq!(io.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn multiple_errors_are_aggregated_in_order() {
        let mut list = ErrorList::new();
        list.push(anyhow::anyhow!("first"));
        list.push(anyhow::anyhow!("second"));

        let err = list.into_result().unwrap_err();
        let list = err.downcast_ref::<ErrorList>().expect("error list");
        assert_eq!(list.len(), 2);

        let messages: Vec<_> = list.iter().map(|e| e.to_string()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[test]
    fn nested_lists_are_flattened() {
        let mut inner = ErrorList::new();
        inner.push(anyhow::anyhow!("a"));
        inner.push(anyhow::anyhow!("b"));

        let mut outer = ErrorList::new();
        outer.push(anyhow::anyhow!("before"));
        outer.push(inner.into_result().unwrap_err());

        assert_eq!(outer.len(), 3);
    }

    #[test]
    fn contains_finds_inner_error_types() {
        let mut list = ErrorList::new();
        list.push(anyhow::anyhow!("unrelated"));
        list.push(io_err(io::ErrorKind::PermissionDenied, "denied"));

        assert!(list.contains::<io::Error>());
    }

    #[test]
    fn contains_walks_source_chains() {
        let wrapped =
            io_err(io::ErrorKind::NotFound, "missing").context("while reading config");

        let mut list = ErrorList::new();
        list.push(wrapped);

        assert!(list.contains::<io::Error>());
    }

    #[test]
    fn display_mirrors_multierror_format() {
        let mut list = ErrorList::new();
        list.push(anyhow::anyhow!("boom"));
        assert!(list.to_string().starts_with("1 error occurred:"));

        list.push(anyhow::anyhow!("bang"));
        assert!(list.to_string().starts_with("2 errors occurred:"));
    }

    #[test]
    fn combine_keeps_both_errors() {
        let err = ErrorList::combine(
            Err(anyhow::anyhow!("original")),
            Err(anyhow::anyhow!("rollback")),
        )
        .unwrap_err();

        let list = err.downcast_ref::<ErrorList>().expect("error list");
        assert_eq!(list.len(), 2);
    }
}
