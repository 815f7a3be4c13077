// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scoped acquisition primitives.
//!
//! Every acquisition the harness performs flows through [`bracket`] or
//! [`protect`], so that device mappings and mounts are released in strict
//! reverse order on every exit path, a panic from a test assertion included.
//! A failure raised while releasing never suppresses the releases of
//! resources acquired earlier, and never replaces the failure that caused
//! the unwind.

use crate::errors::WbResult;

/// Holds the resource and its release action while the body runs, so the
/// release still happens if the body panics.
struct Armed<V, R>
where
    R: FnOnce(V) -> WbResult<()>,
{
    inner: Option<(V, R)>,
}

impl<V, R> Armed<V, R>
where
    R: FnOnce(V) -> WbResult<()>,
{
    fn value(&mut self) -> &mut V {
        &mut self
            .inner
            .as_mut()
            .expect("disarm() is called at most once, after the body has run")
            .0
    }

    fn disarm(&mut self) -> (V, R) {
        self.inner
            .take()
            .expect("disarm() is called at most once, after the body has run")
    }
}

impl<V, R> Drop for Armed<V, R>
where
    R: FnOnce(V) -> WbResult<()>,
{
    fn drop(&mut self) {
        if let Some((v, release)) = self.inner.take() {
            if let Err(err) = release(v) {
                warn!("release action failed while unwinding a panic: {err}");
            }
        }
    }
}

/// Run `body` with the acquired value, then run `release` exactly once,
/// whether the body returned `Ok`, returned `Err`, or panicked.
///
/// The body's error takes precedence over a release error; when both fail
/// the release failure is logged and the body's error propagates. A release
/// failure on the success path surfaces to the caller.
pub fn bracket<V, T, R, B>(v: V, release: R, body: B) -> WbResult<T>
where
    R: FnOnce(V) -> WbResult<()>,
    B: FnOnce(&mut V) -> WbResult<T>,
{
    let mut armed = Armed {
        inner: Some((v, release)),
    };
    let result = body(armed.value());
    let (v, release) = armed.disarm();
    match (result, release(v)) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(rel_err)) => Err(rel_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(rel_err)) => {
            warn!("release action failed: {rel_err}; propagating the original error");
            Err(err)
        }
    }
}

/// [`bracket`] for release actions that close over their resources rather
/// than taking a value.
pub fn bracket_<T, R, B>(release: R, body: B) -> WbResult<T>
where
    R: FnOnce() -> WbResult<()>,
    B: FnOnce() -> WbResult<T>,
{
    bracket((), |()| release(), |()| body())
}

/// Run `body` with the acquired value; run `release` only if the body fails
/// (returns `Err` or panics). On success the value is handed back and the
/// caller owns its release.
///
/// A release failure on the error path is logged; the body's error is the
/// one propagated.
pub fn protect<V, T, R, B>(v: V, release: R, body: B) -> WbResult<(V, T)>
where
    R: FnOnce(V) -> WbResult<()>,
    B: FnOnce(&mut V) -> WbResult<T>,
{
    let mut armed = Armed {
        inner: Some((v, release)),
    };
    match body(armed.value()) {
        Ok(value) => {
            let (v, _) = armed.disarm();
            Ok((v, value))
        }
        Err(err) => {
            let (v, release) = armed.disarm();
            if let Err(rel_err) = release(v) {
                warn!("release action failed: {rel_err}; propagating the original error");
            }
            Err(err)
        }
    }
}

/// [`protect`] for release actions that close over their resources rather
/// than taking a value.
pub fn protect_<T, R, B>(release: R, body: B) -> WbResult<T>
where
    R: FnOnce() -> WbResult<()>,
    B: FnOnce() -> WbResult<T>,
{
    protect((), |()| release(), |()| body()).map(|((), value)| value)
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        panic::{catch_unwind, AssertUnwindSafe},
        rc::Rc,
    };

    use assert_matches::assert_matches;

    use crate::errors::{ErrorEnum, WbError};

    use super::*;

    fn fail(msg: &str) -> WbError {
        WbError::Msg(msg.to_owned())
    }

    /// Three nested brackets must release in reverse acquisition order even
    /// when the innermost body fails and the middle release fails too.
    #[test]
    fn test_nested_release_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let push = |log: &Rc<RefCell<Vec<&'static str>>>, entry: &'static str| {
            log.borrow_mut().push(entry)
        };

        let result: WbResult<()> = bracket_(
            || {
                push(&log, "release outer");
                Ok(())
            },
            || {
                bracket_(
                    || {
                        push(&log, "release middle");
                        Err(fail("middle release failed"))
                    },
                    || {
                        bracket_(
                            || {
                                push(&log, "release inner");
                                Ok(())
                            },
                            || Err(fail("body failed")),
                        )
                    },
                )
            },
        );

        assert_eq!(
            *log.borrow(),
            vec!["release inner", "release middle", "release outer"]
        );
        assert_matches!(result, Err(WbError::Msg(ref msg)) if msg == "body failed");
    }

    /// A release failure on the success path is the surfaced error.
    #[test]
    fn test_release_failure_surfaces_on_success() {
        let result = bracket_(|| Err(fail("release failed")), || Ok(7));
        assert_matches!(result, Err(WbError::Msg(ref msg)) if msg == "release failed");
    }

    /// The release action runs exactly once when the body panics, and the
    /// panic is what propagates.
    #[test]
    fn test_release_runs_on_panic() {
        let count = Rc::new(RefCell::new(0));
        let seen = Rc::clone(&count);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            bracket_(
                || {
                    *seen.borrow_mut() += 1;
                    Ok(())
                },
                || -> WbResult<()> { panic!("assertion failure in body") },
            )
        }));

        assert!(outcome.is_err());
        assert_eq!(*count.borrow(), 1);
    }

    /// protect releases only on the failure path; the successful body gets
    /// its value back untouched.
    #[test]
    fn test_protect_success_skips_release() {
        let released = Rc::new(RefCell::new(false));
        let seen = Rc::clone(&released);

        let (value, body_result) = protect(
            41,
            move |_| {
                *seen.borrow_mut() = true;
                Ok(())
            },
            |v| {
                *v += 1;
                Ok("done")
            },
        )
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(body_result, "done");
        assert!(!*released.borrow());
    }

    #[test]
    fn test_protect_failure_releases() {
        let released = Rc::new(RefCell::new(false));
        let seen = Rc::clone(&released);

        let result: WbResult<(u32, ())> = protect(
            0u32,
            move |_| {
                *seen.borrow_mut() = true;
                Ok(())
            },
            |_| {
                Err(WbError::Harness(
                    ErrorEnum::Map,
                    "acquisition of the next resource failed".into(),
                ))
            },
        );

        assert_matches!(result, Err(WbError::Harness(ErrorEnum::Map, _)));
        assert!(*released.borrow());
    }

    /// protect releases when the body panics.
    #[test]
    fn test_protect_releases_on_panic() {
        let released = Rc::new(RefCell::new(false));
        let seen = Rc::clone(&released);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            protect_(
                || {
                    *seen.borrow_mut() = true;
                    Ok(())
                },
                || -> WbResult<()> { panic!("boom") },
            )
        }));

        assert!(outcome.is_err());
        assert!(*released.borrow());
    }
}
