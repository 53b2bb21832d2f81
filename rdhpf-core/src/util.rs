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

/// The 12-character short form used wherever a container ID is shown to
/// a human (logs, history reasons), per spec.md's Design Notes.
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_ids() {
        assert_eq!(short_id("abcdef0123456789"), "abcdef012345");
    }

    #[test]
    fn leaves_short_ids_alone() {
        assert_eq!(short_id("abc"), "abc");
    }
}
