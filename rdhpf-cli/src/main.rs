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
/// rdhpf keeps local TCP listeners in sync with the published container
/// ports of a remote docker host reachable over SSH.
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let args = rdhpf_core::Args::parse();
    rdhpf_core::run(args)
}
