// farcrawl is a polite, high-throughput web crawler.
// Copyright (C) 2024 The farcrawl Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use thiserror::Error;

/// Errors shared across crates that don't warrant their own error type:
/// config loading and URL normalization.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read config file at {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("url rejected: {0}")]
    InvalidUrl(String),

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl Error {
    /// Whether this error should map to the `config error` (64) exit code
    /// rather than some other fatal path.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::ConfigRead { .. } | Error::ConfigParse(_) | Error::ConfigInvalid(_)
        )
    }
}
