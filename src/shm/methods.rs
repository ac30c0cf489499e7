// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Type-erased method call queues.
//!
//! Each enabled method gets a [`TypeErasedCallQueue`] owning up to two
//! byte regions in the methods segment — one ring for in-args, one for
//! return values — each sized `element_size × queue_size` respecting the
//! element's alignment. A method with no in-args (or no return type)
//! simply has no region for that side.

use crate::error::{Error, Result};
use crate::offset_ptr::{BumpAllocator, DataTypeSizeInfo, SharedMemoryResource};

/// Static/dynamic shape of one method: whether it carries in-args and/or
/// a return value, and their respective sizes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeErasedElementInfo {
    pub in_arg_type_info: Option<DataTypeSizeInfo>,
    pub result_type_info: Option<DataTypeSizeInfo>,
    pub queue_size: usize,
}

/// A byte range within the methods segment, described as an offset and
/// length rather than a raw slice so it stays valid across the
/// process boundary.
#[derive(Debug, Clone, Copy)]
pub struct ByteSpan {
    pub start: usize,
    pub len: usize,
}

/// Owns the memory for one method's in-args and return-value rings.
pub struct TypeErasedCallQueue {
    info: TypeErasedElementInfo,
    in_args_queue_start: Option<usize>,
    result_queue_start: Option<usize>,
}

impl TypeErasedCallQueue {
    /// Allocates its two optional sub-regions from `resource` at
    /// construction time.
    pub fn new(resource: &dyn SharedMemoryResource, info: TypeErasedElementInfo) -> Result<Self> {
        let in_args_queue_start = match info.in_arg_type_info {
            Some(t) => Some(Self::allocate_region(resource, t, info.queue_size)?),
            None => None,
        };
        let result_queue_start = match info.result_type_info {
            Some(t) => Some(Self::allocate_region(resource, t, info.queue_size)?),
            None => None,
        };

        Ok(Self {
            info,
            in_args_queue_start,
            result_queue_start,
        })
    }

    fn allocate_region(
        resource: &dyn SharedMemoryResource,
        type_info: DataTypeSizeInfo,
        queue_size: usize,
    ) -> Result<usize> {
        let total = type_info
            .size
            .checked_mul(queue_size)
            .ok_or_else(|| Error::BindingFailure("method queue size overflow".into()))?;
        resource
            .allocate(total, type_info.align)
            .ok_or_else(|| Error::BindingFailure("methods segment exhausted".into()))
    }

    fn element_span(
        base: usize,
        resource_base: usize,
        position: usize,
        type_info: DataTypeSizeInfo,
        queue_size: usize,
    ) -> Option<ByteSpan> {
        if position >= queue_size {
            return None;
        }
        Some(ByteSpan {
            start: base - resource_base + position * type_info.size,
            len: type_info.size,
        })
    }

    /// Byte span for the in-args of `position`, or `None` if this method
    /// has no in-args or `position` is out of range.
    #[must_use]
    pub fn get_in_args_storage(
        &self,
        resource_base: usize,
        position: usize,
    ) -> Option<ByteSpan> {
        let base = self.in_args_queue_start?;
        Self::element_span(
            base,
            resource_base,
            position,
            self.info.in_arg_type_info?,
            self.info.queue_size,
        )
    }

    /// Byte span for the return value of `position`.
    #[must_use]
    pub fn get_result_storage(&self, resource_base: usize, position: usize) -> Option<ByteSpan> {
        let base = self.result_queue_start?;
        Self::element_span(
            base,
            resource_base,
            position,
            self.info.result_type_info?,
            self.info.queue_size,
        )
    }
}

/// Identifies one method within a service instance's methods segment.
pub type MethodId = u16;

/// Ordered sequence of `(method_id, TypeErasedCallQueue)`, created lazily
/// on first subscribe (spec §4.9).
pub struct MethodData {
    queues: Vec<(MethodId, TypeErasedCallQueue)>,
}

impl MethodData {
    #[must_use]
    pub fn new() -> Self {
        Self { queues: Vec::new() }
    }

    pub fn register(
        &mut self,
        method_id: MethodId,
        resource: &dyn SharedMemoryResource,
        info: TypeErasedElementInfo,
    ) -> Result<()> {
        let queue = TypeErasedCallQueue::new(resource, info)?;
        self.queues.push((method_id, queue));
        Ok(())
    }

    #[must_use]
    pub fn queue(&self, method_id: MethodId) -> Option<&TypeErasedCallQueue> {
        self.queues
            .iter()
            .find(|(id, _)| *id == method_id)
            .map(|(_, q)| q)
    }
}

impl Default for MethodData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_queue_round_trips_positions() {
        let mut backing = vec![0u8; 4096];
        let alloc = unsafe { BumpAllocator::new(backing.as_mut_ptr(), backing.len()) };
        let base = alloc.base_addr();

        let info = TypeErasedElementInfo {
            in_arg_type_info: Some(DataTypeSizeInfo { size: 16, align: 8 }),
            result_type_info: Some(DataTypeSizeInfo { size: 4, align: 4 }),
            queue_size: 4,
        };
        let queue = TypeErasedCallQueue::new(&alloc, info).unwrap();

        let in_args = queue.get_in_args_storage(base, 2).unwrap();
        assert_eq!(in_args.len, 16);
        let result = queue.get_result_storage(base, 2).unwrap();
        assert_eq!(result.len, 4);

        assert!(queue.get_in_args_storage(base, 4).is_none());
    }

    #[test]
    fn method_with_no_return_type_has_no_result_region() {
        let mut backing = vec![0u8; 1024];
        let alloc = unsafe { BumpAllocator::new(backing.as_mut_ptr(), backing.len()) };
        let base = alloc.base_addr();

        let info = TypeErasedElementInfo {
            in_arg_type_info: Some(DataTypeSizeInfo { size: 8, align: 8 }),
            result_type_info: None,
            queue_size: 2,
        };
        let queue = TypeErasedCallQueue::new(&alloc, info).unwrap();
        assert!(queue.get_in_args_storage(base, 0).is_some());
        assert!(queue.get_result_storage(base, 0).is_none());
    }

    #[test]
    fn method_data_looks_up_by_id() {
        let mut backing = vec![0u8; 1024];
        let alloc = unsafe { BumpAllocator::new(backing.as_mut_ptr(), backing.len()) };

        let mut data = MethodData::new();
        data.register(
            7,
            &alloc,
            TypeErasedElementInfo {
                in_arg_type_info: Some(DataTypeSizeInfo { size: 8, align: 8 }),
                result_type_info: None,
                queue_size: 2,
            },
        )
        .unwrap();

        assert!(data.queue(7).is_some());
        assert!(data.queue(8).is_none());
    }
}
