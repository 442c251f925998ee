// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Utility functions and helpers

pub mod logging;
pub mod timing;
pub mod uuid;

pub use self::logging::{init_logging, init_logging_with_level};
pub use self::timing::{BreakdownLog, Stopwatch, BREAKDOWN_FILE};
pub use self::uuid::generate_session_id;
