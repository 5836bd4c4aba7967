// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::str::FromStr;

use snafu::location;

use crate::{Error, Result};

/// Read and parse the environment variable `name`.
///
/// Returns `Ok(None)` when the variable is unset. A value that is set but
/// cannot be parsed is reported as [`Error::InvalidInput`] rather than being
/// silently ignored.
pub fn parse_env_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => parse_value(name, value.trim()).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.parse::<T>().map_err(|err| Error::InvalidInput {
        source: format!("{name}={value:?} is not valid: {err}").into(),
        location: location!(),
    })
}
