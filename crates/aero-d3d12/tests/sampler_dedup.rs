//! Sampler dedup cache behavior across bind groups.

use std::sync::Arc;

use aero_d3d12::binding::{BindGroupEntry, BindGroupLayoutEntry, BindingResource, BindingType, ShaderStages};
use aero_d3d12::{
    DescriptorContext, DescriptorDevice, Sampler, SamplerDesc, SoftwareDevice,
};
use pretty_assertions::assert_eq;

fn context() -> (Arc<SoftwareDevice>, DescriptorContext) {
    let device = Arc::new(SoftwareDevice::new());
    let ctx = DescriptorContext::new(device.clone() as Arc<dyn DescriptorDevice>);
    (device, ctx)
}

fn two_sampler_layout(ctx: &DescriptorContext) -> Arc<aero_d3d12::binding::BindGroupLayout> {
    ctx.create_bind_group_layout(vec![
        BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStages::FRAGMENT,
            ty: BindingType::Sampler,
        },
        BindGroupLayoutEntry {
            binding: 1,
            visibility: ShaderStages::FRAGMENT,
            ty: BindingType::Sampler,
        },
    ])
}

fn sampler_bindings(a: &Arc<Sampler>, b: &Arc<Sampler>) -> Vec<BindGroupEntry> {
    vec![
        BindGroupEntry {
            binding: 0,
            resource: BindingResource::Sampler(a.clone()),
        },
        BindGroupEntry {
            binding: 1,
            resource: BindingResource::Sampler(b.clone()),
        },
    ]
}

#[test]
fn bind_groups_with_identical_sampler_lists_share_one_entry() {
    let (_, ctx) = context();
    let layout = two_sampler_layout(&ctx);
    let a = Sampler::new(SamplerDesc::default());
    let b = Sampler::new(SamplerDesc::default());

    let g1 = ctx
        .create_bind_group(&layout, &sampler_bindings(&a, &b))
        .unwrap();
    let g2 = ctx
        .create_bind_group(&layout, &sampler_bindings(&a, &b))
        .unwrap();

    let e1 = g1.sampler_cache_entry().unwrap();
    let e2 = g2.sampler_cache_entry().unwrap();
    assert!(Arc::ptr_eq(e1, e2));

    // The entry's reference count is exactly the number of live bind groups
    // holding it (the cache index only holds a weak reference).
    assert_eq!(Arc::strong_count(e1), 2);

    drop(g2);
    let e1 = g1.sampler_cache_entry().unwrap();
    assert_eq!(Arc::strong_count(e1), 1);
}

#[test]
fn entry_leaves_the_cache_when_the_last_group_drops() {
    let (_, ctx) = context();
    let layout = two_sampler_layout(&ctx);
    let a = Sampler::new(SamplerDesc::default());
    let b = Sampler::new(SamplerDesc::default());
    let list = [a.clone(), b.clone()];

    let g1 = ctx
        .create_bind_group(&layout, &sampler_bindings(&a, &b))
        .unwrap();
    let g2 = ctx
        .create_bind_group(&layout, &sampler_bindings(&a, &b))
        .unwrap();
    assert!(ctx.sampler_cache().contains(&list));

    drop(g1);
    assert!(ctx.sampler_cache().contains(&list));
    drop(g2);
    assert!(!ctx.sampler_cache().contains(&list));
    assert_eq!(ctx.sampler_cache().live_entries(), 0);
}

#[test]
fn sampler_list_order_is_part_of_the_key() {
    // [A, B] and [B, A] are distinct entries: block offsets are positional
    // per binding, so the two lists describe different blocks.
    let (_, ctx) = context();
    let layout = two_sampler_layout(&ctx);
    let a = Sampler::new(SamplerDesc::default());
    let b = Sampler::new(SamplerDesc::default());

    let g_ab = ctx
        .create_bind_group(&layout, &sampler_bindings(&a, &b))
        .unwrap();
    let g_ba = ctx
        .create_bind_group(&layout, &sampler_bindings(&b, &a))
        .unwrap();

    assert!(!Arc::ptr_eq(
        g_ab.sampler_cache_entry().unwrap(),
        g_ba.sampler_cache_entry().unwrap()
    ));
    assert_eq!(ctx.sampler_cache().live_entries(), 2);
}
