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

use std::io::Write as _;

use assert_cmd::Command;
use predicates::prelude::*;

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn version_flag() {
    Command::cargo_bin("rdrs2")
        .unwrap()
        .arg("-v")
        .assert()
        .success()
        .stdout(predicate::str::contains("rdrs2"));
}

#[test]
fn unknown_option_exits_one() {
    Command::cargo_bin("rdrs2")
        .unwrap()
        .arg("--bogus")
        .assert()
        .failure()
        .code(1);
}

#[test]
fn print_config_uses_config_file() {
    let config = config_file(
        r##"{
            "#comment": "test configuration",
            "REST": {"ServerPort": 9999},
            "Log": {"Level": "info"}
        }"##,
    );
    Command::cargo_bin("rdrs2")
        .unwrap()
        .arg("--config")
        .arg(config.path())
        .arg("--print-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("9999"))
        .stdout(predicate::str::contains("UseHopsworksAPIKeys"));
}

#[test]
fn invalid_config_exits_one() {
    let config = config_file(r#"{"Internal": {"ReqBufferSize": 8}}"#);
    Command::cargo_bin("rdrs2")
        .unwrap()
        .arg("--config")
        .arg(config.path())
        .arg("--print-config")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("ReqBufferSize"));
}

#[test]
fn malformed_config_exits_one() {
    let config = config_file("{not json");
    Command::cargo_bin("rdrs2")
        .unwrap()
        .arg("--config")
        .arg(config.path())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Error parsing config"));
}

#[test]
fn help_config_describes_options() {
    Command::cargo_bin("rdrs2")
        .unwrap()
        .arg("--help-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("ReqBufferSize"))
        .stdout(predicate::str::contains("ConnectionPoolSize"))
        .stdout(predicate::str::contains("CacheRefreshIntervalMS"));
}
