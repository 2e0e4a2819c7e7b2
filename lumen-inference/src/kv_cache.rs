use crate::configuration::ModelConfig;

/// Key/value arena for one decoder layer.
///
/// Both buffers are laid out as `[max_batch_size, max_seq_len, n_kv_heads * head_dim]`
/// and allocated once. A write covers the positions computed by the current
/// step; reads cover the valid prefix of one batch row.
pub struct LayerCache {
    keys: Vec<f32>,
    values: Vec<f32>,
    max_seq_len: usize,
    kv_dim: usize,
}

impl LayerCache {
    fn new(max_batch_size: usize, max_seq_len: usize, kv_dim: usize) -> Self {
        let size = max_batch_size * max_seq_len * kv_dim;
        Self { keys: vec![0.0; size], values: vec![0.0; size], max_seq_len, kv_dim }
    }

    #[inline]
    fn offset(&self, batch_idx: usize, pos: usize) -> usize {
        (batch_idx * self.max_seq_len + pos) * self.kv_dim
    }

    /// Stores keys and values of consecutive positions starting at `start_pos`.
    /// `keys` and `values` hold a whole number of `kv_dim` rows.
    pub fn write(&mut self, batch_idx: usize, start_pos: usize, keys: &[f32], values: &[f32]) {
        debug_assert_eq!(keys.len(), values.len());
        debug_assert_eq!(keys.len() % self.kv_dim, 0);
        debug_assert!(start_pos + keys.len() / self.kv_dim <= self.max_seq_len);

        let start = self.offset(batch_idx, start_pos);
        let end = start + keys.len();
        self.keys[start..end].copy_from_slice(keys);
        self.values[start..end].copy_from_slice(values);
    }

    /// Keys of positions `[0, len)` for one batch row.
    pub fn keys(&self, batch_idx: usize, len: usize) -> &[f32] {
        let start = self.offset(batch_idx, 0);
        &self.keys[start..start + len * self.kv_dim]
    }

    /// Values of positions `[0, len)` for one batch row.
    pub fn values(&self, batch_idx: usize, len: usize) -> &[f32] {
        let start = self.offset(batch_idx, 0);
        &self.values[start..start + len * self.kv_dim]
    }
}

/// Per-layer key/value caches of one loaded model.
///
/// `len` counts positions written by the current request. `reset` makes the
/// whole cache logically unwritten without touching the buffers; every
/// position is written before it is read again.
pub struct KVCache {
    layers: Vec<LayerCache>,
    len: usize,
    max_batch_size: usize,
    max_seq_len: usize,
}

impl KVCache {
    pub fn new(config: &ModelConfig) -> Self {
        let layers = (0..config.n_layers)
            .map(|_| LayerCache::new(config.max_batch_size, config.max_seq_len, config.kv_dim()))
            .collect();

        Self { layers, len: 0, max_batch_size: config.max_batch_size, max_seq_len: config.max_seq_len }
    }

    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Number of valid positions.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Marks positions up to `end_pos` as written. Writing at an earlier
    /// position overwrites it and drops everything after it.
    pub(crate) fn commit(&mut self, end_pos: usize) {
        self.len = end_pos;
    }

    pub fn layer(&self, layer_idx: usize) -> &LayerCache {
        &self.layers[layer_idx]
    }

    pub(crate) fn layers_mut(&mut self) -> std::slice::IterMut<'_, LayerCache> {
        self.layers.iter_mut()
    }

    /// Total size of the key and value buffers in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.layers.iter().map(|layer| (layer.keys.len() + layer.values.len()) * size_of::<f32>()).sum()
    }
}

impl std::fmt::Debug for KVCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KVCache")
            .field("n_layers", &self.layers.len())
            .field("max_batch_size", &self.max_batch_size)
            .field("max_seq_len", &self.max_seq_len)
            .field("len", &self.len)
            .finish()
    }
}
