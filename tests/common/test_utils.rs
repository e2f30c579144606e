use std::path::PathBuf;
use tempfile::TempDir;

/// Backing file in a private temporary directory, removed on drop
pub struct TestFile {
    _dir: TempDir,
    path: PathBuf,
}

impl TestFile {
    /// Create a path for a backing file named after the test; the file
    /// itself does not exist yet
    pub fn new(test_name: &str) -> Self {
        let dir = tempfile::Builder::new()
            .prefix("shm_bloom_test_")
            .tempdir()
            .expect("Failed to create temporary directory");
        let path = dir.path().join(format!("{test_name}.shm"));
        Self { _dir: dir, path }
    }

    pub fn path(&self) -> PathBuf {
        self.path.clone()
    }

    /// Current size of the backing file on disk
    #[allow(dead_code)]
    pub fn len(&self) -> u64 {
        std::fs::metadata(&self.path)
            .expect("Failed to stat backing file")
            .len()
    }

    /// Raw bytes of the backing file
    #[allow(dead_code)]
    pub fn read(&self) -> Vec<u8> {
        std::fs::read(&self.path).expect("Failed to read backing file")
    }

    #[allow(dead_code)]
    pub fn write(&self, bytes: &[u8]) {
        std::fs::write(&self.path, bytes).expect("Failed to write backing file")
    }
}
