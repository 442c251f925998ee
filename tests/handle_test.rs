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

//! Tests for the generation-checked handle table

use mllib_spmd::error::Code;
use mllib_spmd::handle::{Handle, HandleTable};

mod handle_tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut table = HandleTable::new();
        let a = table.insert("alpha".to_string());
        let b = table.insert("beta".to_string());

        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a).unwrap(), "alpha");
        assert_eq!(table.get(b).unwrap(), "beta");

        table.get_mut(a).unwrap().push_str("-1");
        assert_eq!(table.remove(a).unwrap(), "alpha-1");
        assert_eq!(table.len(), 1);
        assert!(!table.contains(a));
        assert!(table.contains(b));

        println!("✓ Handle insert/get/remove works");
    }

    #[test]
    fn test_double_release_is_rejected() {
        let mut table = HandleTable::new();
        let h = table.insert(7u32);
        table.remove(h).unwrap();

        let err = table.remove(h).unwrap_err();
        assert_eq!(err.code(), Code::HandleError);
        assert!(err.to_string().contains("stale"));
    }

    #[test]
    fn test_reused_slot_rejects_old_handle() {
        let mut table = HandleTable::new();
        let old = table.insert(1u32);
        table.remove(old).unwrap();
        let new = table.insert(2u32);

        assert_ne!(old, new);
        assert_eq!(old.as_raw() & 0xFFFF_FFFF, new.as_raw() & 0xFFFF_FFFF);
        assert!(table.get(old).is_err());
        assert_eq!(*table.get(new).unwrap(), 2);

        println!("✓ Reused slot rejects stale handle");
    }

    #[test]
    fn test_null_and_unknown_handles() {
        let table: HandleTable<u32> = HandleTable::new();

        let err = table.get(Handle::from_raw(0)).unwrap_err();
        assert!(err.to_string().contains("null handle"));

        let err = table.get(Handle::from_raw((1 << 32) | 99)).unwrap_err();
        assert_eq!(err.code(), Code::HandleError);
        assert!(err.to_string().contains("unknown handle"));
    }

    #[test]
    fn test_live_handles_are_never_zero() {
        let mut table = HandleTable::new();
        let h = table.insert(());
        assert_ne!(h.as_raw(), 0);
        assert_eq!(Handle::from_raw(h.as_raw()), h);
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let mut table = HandleTable::new();
        let handles: Vec<Handle> = (0..5).map(|i| table.insert(i)).collect();
        assert_eq!(table.handles().len(), 5);

        table.clear();
        assert!(table.is_empty());
        assert!(table.handles().is_empty());
        for h in handles {
            assert!(table.get(h).is_err());
        }

        let fresh = table.insert(42);
        assert_eq!(*table.get(fresh).unwrap(), 42);
    }
}
