//! Query heaps over Vulkan query pools.

use std::sync::Arc;

use ash::vk;

use crate::device::Device;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryHeapType {
    Occlusion,
    Timestamp,
    PipelineStatistics,
    /// Stream output statistics; requires transform feedback queries.
    SoStatistics,
}

#[derive(Clone, Copy, Debug)]
pub struct QueryHeapDesc {
    pub heap_type: QueryHeapType,
    pub count: u32,
}

/// Every graphics pipeline statistic D3D12 exposes.
fn pipeline_statistics_mask() -> vk::QueryPipelineStatisticFlags {
    vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_VERTICES
        | vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_PRIMITIVES
        | vk::QueryPipelineStatisticFlags::VERTEX_SHADER_INVOCATIONS
        | vk::QueryPipelineStatisticFlags::GEOMETRY_SHADER_INVOCATIONS
        | vk::QueryPipelineStatisticFlags::GEOMETRY_SHADER_PRIMITIVES
        | vk::QueryPipelineStatisticFlags::CLIPPING_INVOCATIONS
        | vk::QueryPipelineStatisticFlags::CLIPPING_PRIMITIVES
        | vk::QueryPipelineStatisticFlags::FRAGMENT_SHADER_INVOCATIONS
        | vk::QueryPipelineStatisticFlags::TESSELLATION_CONTROL_SHADER_PATCHES
        | vk::QueryPipelineStatisticFlags::TESSELLATION_EVALUATION_SHADER_INVOCATIONS
        | vk::QueryPipelineStatisticFlags::COMPUTE_SHADER_INVOCATIONS
}

fn map_query_type(
    device: &Device,
    heap_type: QueryHeapType,
) -> Result<(vk::QueryType, vk::QueryPipelineStatisticFlags)> {
    match heap_type {
        QueryHeapType::Occlusion => {
            Ok((vk::QueryType::OCCLUSION, vk::QueryPipelineStatisticFlags::empty()))
        }
        QueryHeapType::Timestamp => {
            Ok((vk::QueryType::TIMESTAMP, vk::QueryPipelineStatisticFlags::empty()))
        }
        QueryHeapType::PipelineStatistics => {
            Ok((vk::QueryType::PIPELINE_STATISTICS, pipeline_statistics_mask()))
        }
        QueryHeapType::SoStatistics => {
            if !device.caps.transform_feedback_queries {
                warn!("stream output statistics queries are not supported");
                return Err(Error::NotImplemented("stream output statistics queries"));
            }
            Ok((
                vk::QueryType::TRANSFORM_FEEDBACK_STREAM_EXT,
                vk::QueryPipelineStatisticFlags::empty(),
            ))
        }
    }
}

pub struct QueryHeap {
    pub(crate) vk_query_pool: vk::QueryPool,
    pub heap_type: QueryHeapType,
    pub count: u32,
}

impl QueryHeap {
    pub(crate) fn new(device: &Device, desc: &QueryHeapDesc) -> Result<Arc<QueryHeap>> {
        let (query_type, pipeline_statistics) = map_query_type(device, desc.heap_type)?;

        let pool_info = vk::QueryPoolCreateInfo::builder()
            .query_type(query_type)
            .query_count(desc.count)
            .pipeline_statistics(pipeline_statistics);
        let vk_query_pool = unsafe { device.raw.create_query_pool(&pool_info, None) }?;

        Ok(Arc::new(QueryHeap {
            vk_query_pool,
            heap_type: desc.heap_type,
            count: desc.count,
        }))
    }

    pub(crate) fn destroy(&self, device: &Device) {
        unsafe { device.raw.destroy_query_pool(self.vk_query_pool, None) };
    }
}

#[cfg(test)]
mod query_tests {
    use super::*;

    #[test]
    fn statistics_mask_matches_the_eleven_counters() {
        assert_eq!(pipeline_statistics_mask().as_raw().count_ones(), 11);
    }
}
