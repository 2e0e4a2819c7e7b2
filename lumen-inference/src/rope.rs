use crate::configuration::{ModelConfig, RotaryLayout};

/// Rotary Position Embedding (RoPE) table.
///
/// Holds `cos`/`sin` of the angle `p / base^(2i / rotary_dim)` for every
/// position `p` in `[0, 2 * max_seq_len)` and channel pair `i` in
/// `[0, rotary_dim / 2)`. Rotating a query and a key by their positions
/// leaves their dot product dependent only on the position offset.
pub struct RotaryTable {
    rotary_dim: usize,
    layout: RotaryLayout,
    positions: usize,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RotaryTable {
    pub fn new(config: &ModelConfig) -> Self {
        Self::with_positions(config.rotary_dim, config.rope_base, config.rotary_layout, 2 * config.max_seq_len)
    }

    pub fn with_positions(rotary_dim: usize, rope_base: f32, layout: RotaryLayout, positions: usize) -> Self {
        debug_assert!(rotary_dim % 2 == 0, "rotary dimension must be even");

        let half = rotary_dim / 2;
        let inv_freqs = (0..half)
            .map(|i| (rope_base as f64).powf(-((2 * i) as f64) / rotary_dim as f64))
            .collect::<Vec<_>>();

        let mut cos = Vec::with_capacity(positions * half);
        let mut sin = Vec::with_capacity(positions * half);
        for pos in 0..positions {
            for &inv_freq in &inv_freqs {
                let angle = pos as f64 * inv_freq;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }

        Self { rotary_dim, layout, positions, cos, sin }
    }

    pub fn positions(&self) -> usize {
        self.positions
    }

    /// Rotation factors for positions `[start_pos, start_pos + len)`.
    pub fn slice(&self, start_pos: usize, len: usize) -> RotarySlice<'_> {
        debug_assert!(start_pos + len <= self.positions, "rotary table has {} positions", self.positions);

        let half = self.rotary_dim / 2;
        let range = start_pos * half..(start_pos + len) * half;
        RotarySlice { cos: &self.cos[range.clone()], sin: &self.sin[range], half, layout: self.layout }
    }
}

impl std::fmt::Debug for RotaryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotaryTable")
            .field("rotary_dim", &self.rotary_dim)
            .field("layout", &self.layout)
            .field("positions", &self.positions)
            .finish()
    }
}

/// The part of a [`RotaryTable`] used by one forward step.
#[derive(Clone, Copy)]
pub struct RotarySlice<'a> {
    cos: &'a [f32],
    sin: &'a [f32],
    half: usize,
    layout: RotaryLayout,
}

impl RotarySlice<'_> {
    /// Number of positions in the slice.
    pub fn len(&self) -> usize {
        if self.half == 0 { 0 } else { self.cos.len() / self.half }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rotates one head vector by the angles of the `offset`-th position in the slice.
    /// Channels past the rotary dimension are left unchanged.
    pub fn apply(&self, offset: usize, head: &mut [f32]) {
        let range = offset * self.half..(offset + 1) * self.half;
        let cos = &self.cos[range.clone()];
        let sin = &self.sin[range];

        match self.layout {
            RotaryLayout::Interleaved => {
                head[..2 * self.half].chunks_exact_mut(2).zip(cos.iter().zip(sin)).for_each(|(pair, (&c, &s))| {
                    let (x, y) = (pair[0], pair[1]);
                    pair[0] = x * c - y * s;
                    pair[1] = x * s + y * c;
                });
            }
            RotaryLayout::HalfSplit => {
                let (first_half, rest) = head.split_at_mut(self.half);
                first_half.iter_mut().zip(rest[..self.half].iter_mut()).zip(cos.iter().zip(sin)).for_each(
                    |((x, y), (&c, &s))| {
                        let (x_val, y_val) = (*x, *y);
                        *x = x_val * c - y_val * s;
                        *y = x_val * s + y_val * c;
                    },
                );
            }
        }
    }
}
