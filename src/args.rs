// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::config::CONFIG_FILE_ENV;

#[derive(Clone, Debug, Parser, Default)]
#[command(
    name = "rdrs2",
    about = "Online feature store REST serving layer",
    version,
    disable_version_flag = true
)]
pub struct RdrsArgs {
    /// Path to the JSON configuration file. Falls back to the
    /// RDRS_CONFIG_FILE environment variable.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    pub print_config: bool,

    /// Describe the recognized configuration options and exit.
    #[arg(long)]
    pub help_config: bool,

    /// Print version information and exit.
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

impl RdrsArgs {
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_flag() {
        let args = RdrsArgs::parse_from(["rdrs2", "--config", "/tmp/config.json"]);
        assert_eq!(args.config_path(), Some(PathBuf::from("/tmp/config.json")));
        assert!(!args.print_config);
    }

    #[test]
    fn print_config_flag() {
        let args = RdrsArgs::parse_from(["rdrs2", "--print-config"]);
        assert!(args.print_config);
    }

    #[test]
    fn unknown_option_is_an_error() {
        assert!(RdrsArgs::try_parse_from(["rdrs2", "--bogus"]).is_err());
    }
}
