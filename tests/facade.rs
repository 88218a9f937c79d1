//! Smoke tests through the `tessel` facade: configure a trunk from
//! `tessel.toml`, commit, walk.

use std::sync::Arc;
use tempfile::TempDir;
use tessel::{
    Branch, BranchConfig, Extension, Granularity, ObjectId, TesselResult, TransactionFlags,
    TransactionManager, Value, Version, VersionMap, Visit, Visitor, Walker, CONFIG_FILE_NAME,
};

struct Count(Arc<parking_lot::Mutex<usize>>);

impl Visitor for Count {
    fn visit_write(
        &mut self,
        _branch: &Branch,
        _map: &Arc<VersionMap>,
        _version: &Version,
    ) -> TesselResult<Visit> {
        *self.0.lock() += 1;
        Ok(Visit::Continue)
    }
}

#[test]
fn test_branch_from_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(&path, "granularity = \"all\"\n").unwrap();
    let config = BranchConfig::from_file(&path).unwrap();
    assert_eq!(config.granularity, Granularity::All);

    let trunk = Branch::trunk(config);
    let count = Arc::new(parking_lot::Mutex::new(0));
    let walker = Walker::new(Count(Arc::clone(&count)));
    trunk.register(Extension::Walker(Arc::clone(&walker))).unwrap();

    let manager = TransactionManager::new();
    for i in 0..3 {
        let mut txn = manager.begin(&trunk, TransactionFlags::NONE);
        txn.set(ObjectId(i), "name", "tessel").unwrap();
        assert!(manager.commit_transaction(&mut txn).unwrap().is_success());
    }
    // The walker keeps every map, including the empty base, until delivered
    assert_eq!(trunk.current().len(), 4);

    walker.run().unwrap();
    assert_eq!(*count.lock(), 3);
    assert_eq!(
        trunk.current().field(ObjectId(2), "name"),
        Some(Value::String("tessel".to_string()))
    );
}
