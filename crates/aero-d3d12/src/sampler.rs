//! Sampler objects and the sampler descriptor-block dedup cache.
//!
//! Sampler shader-visible heaps are tiny (2048 slots on D3D12), and
//! applications tend to reuse a handful of sampler configurations across
//! thousands of bind groups. The cache maps an *ordered* list of sampler
//! identities to a single shared CPU descriptor block, so every bind group
//! with the same sampler list shares one block and, transitively, one
//! GPU-visible copy of it per heap generation.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use hashbrown::HashMap;
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64;

use crate::device::{DescriptorDevice, DescriptorWrite, DeviceError, GpuDescriptorHandle, HeapKind};
use crate::serial::Serial;
use crate::shader_visible::{GpuDescriptorAllocation, HeapVersion, ShaderVisibleDescriptorAllocator};
use crate::staging::{CpuDescriptorBlock, StagingAllocators};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum AddressMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CompareFunction {
    Never,
    Less,
    LessEqual,
    Equal,
    NotEqual,
    GreaterEqual,
    Greater,
    Always,
}

/// Immutable sampler configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mip_filter: FilterMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub lod_min_clamp: f32,
    pub lod_max_clamp: f32,
    pub compare: Option<CompareFunction>,
    pub max_anisotropy: u16,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            min_filter: FilterMode::Nearest,
            mag_filter: FilterMode::Nearest,
            mip_filter: FilterMode::Nearest,
            address_u: AddressMode::ClampToEdge,
            address_v: AddressMode::ClampToEdge,
            address_w: AddressMode::ClampToEdge,
            lod_min_clamp: 0.0,
            lod_max_clamp: 32.0,
            compare: None,
            max_anisotropy: 1,
        }
    }
}

/// Unique identity of one frontend sampler object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(transparent)]
pub struct SamplerId(pub u64);

static NEXT_SAMPLER_ID: AtomicU64 = AtomicU64::new(1);

/// A frontend sampler object. Identity, not content, keys the dedup cache:
/// two samplers created from the same descriptor are distinct cache-wise.
#[derive(Debug)]
pub struct Sampler {
    id: SamplerId,
    desc: SamplerDesc,
}

impl Sampler {
    pub fn new(desc: SamplerDesc) -> Arc<Sampler> {
        Arc::new(Sampler {
            id: SamplerId(NEXT_SAMPLER_ID.fetch_add(1, Ordering::Relaxed)),
            desc,
        })
    }

    pub fn id(&self) -> SamplerId {
        self.id
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

/// Cache key: the ordered sampler identity list.
///
/// Order matters. The shared block's internal offsets are positional per
/// binding, so `[A, B]` and `[B, A]` describe different blocks even though
/// they reference the same sampler set. The hash is precomputed once (xxh3
/// over the raw ids) since keys are hashed on every lookup and every entry
/// drop.
#[derive(Debug)]
struct SamplerSetKey {
    ids: Box<[SamplerId]>,
    hash: u64,
}

impl SamplerSetKey {
    fn new(samplers: &[Arc<Sampler>]) -> Self {
        let ids: Box<[SamplerId]> = samplers.iter().map(|s| s.id()).collect();
        let hash = xxh3_64(bytemuck::cast_slice(&ids));
        Self { ids, hash }
    }
}

impl PartialEq for SamplerSetKey {
    fn eq(&self, other: &Self) -> bool {
        // Element-wise, in order.
        self.ids == other.ids
    }
}

impl Eq for SamplerSetKey {}

impl Hash for SamplerSetKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

type CacheIndex = Mutex<HashMap<SamplerSetKey, Weak<SamplerHeapCacheEntry>>>;

/// One shared CPU descriptor block for one ordered sampler list, plus its
/// (lazily populated) GPU-visible copy.
///
/// Entries are reference-counted by the bind groups holding them; the last
/// drop removes the entry from the cache index *before* releasing the CPU
/// block, so the index never points at a freed block.
pub struct SamplerHeapCacheEntry {
    samplers: Vec<Arc<Sampler>>,
    block: CpuDescriptorBlock,
    gpu: Mutex<GpuDescriptorAllocation>,
    index: Weak<CacheIndex>,
    staging: Arc<Mutex<StagingAllocators>>,
}

impl SamplerHeapCacheEntry {
    pub fn sampler_count(&self) -> u32 {
        self.block.count()
    }

    pub fn cpu_block(&self) -> &CpuDescriptorBlock {
        &self.block
    }

    /// Ensure this entry's descriptors are present in the current
    /// shader-visible sampler heap.
    ///
    /// No-op success while the existing GPU allocation's generation is still
    /// current. Returns `false` exactly when the ring allocation failed,
    /// which is the caller's signal to switch heaps and retry. Shared across every
    /// bind group referencing this entry, so the copy happens once per heap
    /// generation, not once per bind group.
    pub fn populate(
        &self,
        device: &dyn DescriptorDevice,
        allocator: &mut ShaderVisibleDescriptorAllocator,
        pending: Serial,
    ) -> bool {
        let mut gpu = self.gpu.lock().unwrap();
        if allocator.is_allocation_still_valid(&gpu) {
            return true;
        }
        let Some((dst, allocation)) = allocator.allocate_gpu_descriptors(self.block.count(), pending)
        else {
            return false;
        };
        device.copy_descriptors(self.block.base(), dst, self.block.count());
        trace!(count = self.block.count(), "populated sampler table");
        *gpu = allocation;
        true
    }

    /// GPU base of the populated table. Only meaningful after a successful
    /// [`populate`] in the current generation.
    ///
    /// [`populate`]: SamplerHeapCacheEntry::populate
    pub fn gpu_base(&self) -> GpuDescriptorHandle {
        let gpu = self.gpu.lock().unwrap();
        debug_assert!(gpu.version() != HeapVersion::NONE, "sampler table not populated");
        gpu.base()
    }
}

impl Drop for SamplerHeapCacheEntry {
    fn drop(&mut self) {
        // Index removal must happen before the block is released.
        if let Some(index) = self.index.upgrade() {
            let mut map = index.lock().unwrap();
            let key = SamplerSetKey::new(&self.samplers);
            if map.get(&key).is_some_and(|weak| weak.strong_count() == 0) {
                map.remove(&key);
            }
            // Whatever remains under this key is a live replacement entry,
            // never a dangling reference to us.
            debug_assert!(map
                .get(&key)
                .map_or(true, |weak| weak.strong_count() > 0));
        }
        self.staging
            .lock()
            .unwrap()
            .deallocate(HeapKind::Sampler, self.block);
    }
}

/// Dedup cache mapping ordered sampler lists to shared heap blocks.
pub struct SamplerHeapCache {
    device: Arc<dyn DescriptorDevice>,
    staging: Arc<Mutex<StagingAllocators>>,
    index: Arc<CacheIndex>,
}

impl SamplerHeapCache {
    pub fn new(device: Arc<dyn DescriptorDevice>, staging: Arc<Mutex<StagingAllocators>>) -> Self {
        Self {
            device,
            staging,
            index: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return the shared entry for `samplers`, creating it on first use.
    ///
    /// On a miss the CPU block is allocated and fully written before the
    /// entry becomes visible in the index: a lookup can never observe an
    /// entry without a valid block.
    pub fn get_or_create(
        &self,
        samplers: &[Arc<Sampler>],
    ) -> Result<Arc<SamplerHeapCacheEntry>, DeviceError> {
        assert!(!samplers.is_empty(), "sampler set must be nonempty");
        let key = SamplerSetKey::new(samplers);

        if let Some(entry) = self
            .index
            .lock()
            .unwrap()
            .get(&key)
            .and_then(Weak::upgrade)
        {
            trace!(hash = key.hash, "sampler set cache hit");
            return Ok(entry);
        }

        let block = self
            .staging
            .lock()
            .unwrap()
            .allocate(HeapKind::Sampler, samplers.len() as u32)?;
        for (i, sampler) in samplers.iter().enumerate() {
            self.device
                .write_descriptor(block.handle(i as u32), &DescriptorWrite::Sampler(*sampler.desc()));
        }
        debug!(count = samplers.len(), hash = key.hash, "sampler set cache miss");

        let entry = Arc::new(SamplerHeapCacheEntry {
            samplers: samplers.to_vec(),
            block,
            gpu: Mutex::new(GpuDescriptorAllocation::INVALID),
            index: Arc::downgrade(&self.index),
            staging: Arc::clone(&self.staging),
        });
        self.index
            .lock()
            .unwrap()
            .insert(key, Arc::downgrade(&entry));
        Ok(entry)
    }

    /// Whether a live entry exists for exactly this ordered list.
    pub fn contains(&self, samplers: &[Arc<Sampler>]) -> bool {
        let key = SamplerSetKey::new(samplers);
        self.index
            .lock()
            .unwrap()
            .get(&key)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Number of live entries in the index.
    pub fn live_entries(&self) -> usize {
        self.index
            .lock()
            .unwrap()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;
    use crate::staging::StagingHeapOptions;

    fn cache() -> (Arc<SoftwareDevice>, SamplerHeapCache) {
        let device = Arc::new(SoftwareDevice::new());
        let staging = Arc::new(Mutex::new(StagingAllocators::new(
            device.clone(),
            StagingHeapOptions::default(),
        )));
        (device.clone(), SamplerHeapCache::new(device, staging))
    }

    #[test]
    fn identical_lists_share_an_entry() {
        let (_, cache) = cache();
        let a = Sampler::new(SamplerDesc::default());
        let b = Sampler::new(SamplerDesc {
            mag_filter: FilterMode::Linear,
            ..SamplerDesc::default()
        });

        let first = cache.get_or_create(&[a.clone(), b.clone()]).unwrap();
        let second = cache.get_or_create(&[a.clone(), b.clone()]).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.live_entries(), 1);
    }

    #[test]
    fn order_is_part_of_the_key() {
        let (_, cache) = cache();
        let a = Sampler::new(SamplerDesc::default());
        let b = Sampler::new(SamplerDesc::default());

        let ab = cache.get_or_create(&[a.clone(), b.clone()]).unwrap();
        let ba = cache.get_or_create(&[b.clone(), a.clone()]).unwrap();
        assert!(!Arc::ptr_eq(&ab, &ba));
        assert_eq!(cache.live_entries(), 2);
    }

    #[test]
    fn last_drop_removes_the_index_entry() {
        let (_, cache) = cache();
        let a = Sampler::new(SamplerDesc::default());

        let entry = cache.get_or_create(&[a.clone()]).unwrap();
        let again = cache.get_or_create(&[a.clone()]).unwrap();
        assert!(cache.contains(&[a.clone()]));

        drop(entry);
        assert!(cache.contains(&[a.clone()]));
        drop(again);
        assert!(!cache.contains(&[a.clone()]));
        assert_eq!(cache.live_entries(), 0);
    }

    #[test]
    fn entry_descriptors_are_written_at_creation() {
        let (device, cache) = cache();
        let desc = SamplerDesc {
            min_filter: FilterMode::Linear,
            ..SamplerDesc::default()
        };
        let sampler = Sampler::new(desc);
        let entry = cache.get_or_create(&[sampler]).unwrap();

        assert_eq!(
            device.descriptor_at(entry.cpu_block().handle(0)),
            Some(DescriptorWrite::Sampler(desc))
        );
    }
}
