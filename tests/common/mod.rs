//! Shared functionality which is used across the integration tests.
//!
//! Probe images embed routine tokens in their executable sections; the token
//! bytes are what the mapper's entry invoker fetches and dispatches, so a
//! probe's behaviour is defined by the closures registered here.

#![allow(dead_code)]

use std::sync::Arc;

use lodestone::{
    prelude::*,
    process::routines::{RoutineFrame, RoutineToken},
};

pub const RX: SectionProtection = SectionProtection::READ.union(SectionProtection::EXECUTE);
pub const RW: SectionProtection = SectionProtection::READ.union(SectionProtection::WRITE);

/// Register a closure as a routine of the process.
pub fn register<F>(space: &Arc<ProcessSpace>, routine: F) -> RoutineToken
where
    F: Fn(&RoutineFrame) -> u32 + Send + Sync + 'static,
{
    space.routines().register(Arc::new(routine))
}

/// A zeroed code section with routine tokens embedded at the given offsets.
pub fn code_section(len: usize, tokens: &[(usize, RoutineToken)]) -> Vec<u8> {
    let mut code = vec![0u8; len];
    for (offset, token) in tokens {
        code[*offset..*offset + 4].copy_from_slice(&token.to_bytes());
    }
    code
}

/// An image whose entry routine at RVA 0x1000 runs the given closure.
pub fn entry_image<F>(space: &Arc<ProcessSpace>, routine: F) -> Vec<u8>
where
    F: Fn(&RoutineFrame) -> u32 + Send + Sync + 'static,
{
    let token = register(space, routine);
    ImageBuilder::new(PlatformAbi::Width64)
        .entry_point(0x1000)
        .section(0x1000, code_section(0x20, &[(0, token)]), RX)
        .build()
        .unwrap()
}
