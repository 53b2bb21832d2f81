// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;
use rdhpf_core::{Args, Commands};

#[test]
fn parses_run_with_an_endpoint() {
    let args = Args::parse_from(["rdhpf", "run", "--endpoint", "ssh://dev@build-box:2222"]);
    match args.command {
        Commands::Run { endpoint } => assert_eq!(endpoint, "ssh://dev@build-box:2222"),
        other => panic!("expected Run, got {:?}", other),
    }
}

#[test]
fn parses_status_with_json_flag() {
    let args = Args::parse_from(["rdhpf", "status", "--endpoint", "dev@build-box", "--json"]);
    match args.command {
        Commands::Status { endpoint, json } => {
            assert_eq!(endpoint, "dev@build-box");
            assert!(json);
        }
        other => panic!("expected Status, got {:?}", other),
    }
}

#[test]
fn status_without_json_flag_defaults_to_table_output() {
    let args = Args::parse_from(["rdhpf", "status", "--endpoint", "dev@build-box"]);
    match args.command {
        Commands::Status { json, .. } => assert!(!json),
        other => panic!("expected Status, got {:?}", other),
    }
}

#[test]
fn verbose_flag_can_be_repeated() {
    let args = Args::parse_from(["rdhpf", "-vv", "run", "--endpoint", "dev@build-box"]);
    assert_eq!(args.verbose, 2);
}

#[test]
fn rejects_a_run_command_missing_its_required_endpoint() {
    let result = Args::try_parse_from(["rdhpf", "run"]);
    assert!(result.is_err());
}
