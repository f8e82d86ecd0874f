use std::path::{Path, PathBuf};

/// Per-index file layout. Every file shares one base path `P`:
///
/// ```text
///   P.meta       header, schema, settings, chunk ids
///   P.ram        optional RAM-layer snapshot
///   P.settings   mutable settings overlay
///   P.tlog       transaction log
///   P.lock       exclusive process lock
///   P.<N>.*      disk chunk N (multi-file)
/// ```
#[derive(Debug, Clone)]
pub struct IndexLayout {
    base: PathBuf,
}

impl IndexLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        IndexLayout { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn with_ext(&self, ext: &str) -> PathBuf {
        let mut path = self.base.as_os_str().to_owned();
        path.push(".");
        path.push(ext);
        PathBuf::from(path)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.with_ext("meta")
    }

    pub fn ram_path(&self) -> PathBuf {
        self.with_ext("ram")
    }

    /// Staging file for atomic `.ram` replacement
    pub fn ram_new_path(&self) -> PathBuf {
        self.with_ext("ram.new")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.with_ext("settings")
    }

    pub fn tlog_path(&self) -> PathBuf {
        self.with_ext("tlog")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.with_ext("lock")
    }

    /// One file of disk chunk `id`; `ext` is the chunk-file kind
    pub fn chunk_path(&self, id: u32, ext: &str) -> PathBuf {
        self.with_ext(&format!("{id}.{ext}"))
    }

    /// All on-disk files belonging to chunk `id`
    pub fn chunk_files(&self, id: u32) -> Vec<PathBuf> {
        crate::chunk::CHUNK_FILE_EXTS
            .iter()
            .map(|ext| self.chunk_path(id, ext))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_share_base() {
        let layout = IndexLayout::new("/data/idx/products");
        assert_eq!(layout.meta_path(), PathBuf::from("/data/idx/products.meta"));
        assert_eq!(
            layout.chunk_path(3, "spd"),
            PathBuf::from("/data/idx/products.3.spd")
        );
    }
}
