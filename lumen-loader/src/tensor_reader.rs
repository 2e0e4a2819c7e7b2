use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use lumen_inference::Tensor;
use memmap2::Mmap;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    mem,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Reads tensors from the SafeTensors files of one model directory.
///
/// File headers are indexed once; tensor data is decoded on request from
/// memory maps kept in a small LRU cache.
#[derive(Debug)]
pub(crate) struct TensorReader {
    index: HashMap<String, PathBuf>,
    mmap_cache: Mutex<MmapCache>,
}

impl TensorReader {
    const MAX_CACHED_FILES: usize = 10;

    pub fn new(model_dir: &Path) -> Result<Self> {
        let mut safetensors_files = std::fs::read_dir(model_dir)
            .with_context(|| format!("Failed to read directory: {}", model_dir.display()))?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                matches!(path.extension(), Some(ext) if ext == "safetensors").then_some(path)
            })
            .collect::<Vec<_>>();

        if safetensors_files.is_empty() {
            anyhow::bail!("No SafeTensors files found in {}", model_dir.display());
        }
        safetensors_files.sort();

        info!("Found {} safetensor files", safetensors_files.len());

        let reader = Self { index: HashMap::new(), mmap_cache: Mutex::new(MmapCache::new(Self::MAX_CACHED_FILES)) };

        let mut index = HashMap::new();
        for path in safetensors_files {
            let mmap = reader.get_mmap(&path)?;
            let safetensors = SafeTensors::deserialize(&mmap)
                .with_context(|| format!("Failed to deserialize {}", path.display()))?;

            for name in safetensors.names() {
                if let Some(previous) = index.insert(name.clone(), path.clone()) {
                    warn!("Tensor {name} is stored in both {} and {}", previous.display(), path.display());
                }
            }
        }
        debug!("Indexed {} tensors", index.len());

        Ok(Self { index, ..reader })
    }

    pub fn contains(&self, tensor_name: &str) -> bool {
        self.index.contains_key(tensor_name)
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Loads a tensor by name, converting BF16/F32 data to F32 and keeping the stored shape.
    pub fn load_tensor(&self, tensor_name: &str) -> Result<Option<Tensor>> {
        let Some(path) = self.index.get(tensor_name) else {
            return Ok(None);
        };

        let mmap = self.get_mmap(path)?;
        let safetensors =
            SafeTensors::deserialize(&mmap).with_context(|| format!("Failed to deserialize {}", path.display()))?;
        let tensor_view = safetensors
            .tensor(tensor_name)
            .with_context(|| format!("Failed to read {tensor_name} from {}", path.display()))?;

        let data = Self::convert_tensor_to_f32(&tensor_view, tensor_name)?;
        Tensor::new(tensor_view.shape().to_vec(), data).map(Some)
    }

    /// Convert tensor data to f32 based on its data type
    fn convert_tensor_to_f32(tensor_view: &TensorView<'_>, tensor_name: &str) -> Result<Vec<f32>> {
        let tensor_data = tensor_view.data();
        let expected_elements = tensor_view.shape().iter().product::<usize>();

        match tensor_view.dtype() {
            Dtype::F32 => {
                Self::validate_tensor_size(tensor_data.len(), expected_elements * mem::size_of::<f32>(), tensor_name, "F32")?;
                let mut values = vec![0.0f32; expected_elements];
                LittleEndian::read_f32_into(tensor_data, &mut values);
                Ok(values)
            }
            Dtype::BF16 => {
                Self::validate_tensor_size(tensor_data.len(), expected_elements * 2, tensor_name, "BF16")?;
                let mut bits = vec![0u16; expected_elements];
                LittleEndian::read_u16_into(tensor_data, &mut bits);
                // BF16 is the upper half of an F32
                Ok(bits.into_iter().map(|bf16_bits| f32::from_bits((bf16_bits as u32) << 16)).collect())
            }
            dtype => anyhow::bail!("Unsupported tensor dtype {:?} for {}", dtype, tensor_name),
        }
    }

    fn validate_tensor_size(actual_bytes: usize, expected_bytes: usize, tensor_name: &str, dtype_name: &str) -> Result<()> {
        if actual_bytes != expected_bytes {
            anyhow::bail!(
                "{} tensor {} size mismatch. Expected {} bytes, got {}",
                dtype_name,
                tensor_name,
                expected_bytes,
                actual_bytes
            );
        }
        Ok(())
    }

    /// Get or create a cached memory mapping for a file
    fn get_mmap(&self, path: &Path) -> Result<Arc<Mmap>> {
        let mut cache = self.mmap_cache.lock().map_err(|_| anyhow::anyhow!("Failed to acquire cache lock"))?;

        if let Some(cached_mmap) = cache.get(path) {
            return Ok(cached_mmap);
        }

        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

        // SAFETY: the map is only read, and model files are not expected to
        // change while they are loaded. Modifying a mapped file is undefined behavior.
        let mmap = Arc::new(unsafe { Mmap::map(&file) }.with_context(|| format!("Failed to memory map {}", path.display()))?);

        cache.insert(path.to_path_buf(), Arc::clone(&mmap));
        Ok(mmap)
    }
}

/// LRU cache of file memory maps
#[derive(Debug)]
struct MmapCache {
    cache: HashMap<PathBuf, Arc<Mmap>>,
    access_order: VecDeque<PathBuf>,
    max_size: usize,
}

impl MmapCache {
    fn new(max_size: usize) -> Self {
        Self { cache: HashMap::new(), access_order: VecDeque::new(), max_size }
    }

    fn get(&mut self, path: &Path) -> Option<Arc<Mmap>> {
        let mmap = Arc::clone(self.cache.get(path)?);
        self.touch(path);
        Some(mmap)
    }

    fn insert(&mut self, path: PathBuf, mmap: Arc<Mmap>) {
        if self.cache.remove(&path).is_some() {
            self.access_order.retain(|cached| cached != &path);
        }

        // Evict least recently used
        while self.cache.len() >= self.max_size {
            let Some(lru_path) = self.access_order.pop_back() else {
                break;
            };
            self.cache.remove(&lru_path);
        }

        self.cache.insert(path.clone(), mmap);
        self.access_order.push_front(path);
    }

    fn touch(&mut self, path: &Path) {
        if let Some(pos) = self.access_order.iter().position(|cached| cached == path) {
            if let Some(recent) = self.access_order.remove(pos) {
                self.access_order.push_front(recent);
            }
        }
    }
}
