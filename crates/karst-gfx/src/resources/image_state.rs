//! image 各 subresource 的状态追踪
//!
//! 记录每个 (mip, layer) 当前的 layout/stage/access，
//! 用于在录制 command buffer 时生成最小数量的 barrier。

use ash::vk;

/// image 某个 subresource 的完整同步状态
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxImageState {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl GfxImageState {
    /// 由目标 layout 推导出典型的 stage/access 组合
    ///
    /// 同一个 layout 总是映射到同一组 stage/access，保证状态追踪的确定性
    pub fn for_layout(layout: vk::ImageLayout) -> Self {
        let (stage, access) = match layout {
            vk::ImageLayout::UNDEFINED => {
                (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::empty())
            }
            vk::ImageLayout::GENERAL => (
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
            ),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
                (vk::PipelineStageFlags2::FRAGMENT_SHADER, vk::AccessFlags2::SHADER_READ)
            }
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
                (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ)
            }
            vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
                (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
            }
            vk::ImageLayout::PRESENT_SRC_KHR => {
                (vk::PipelineStageFlags2::BOTTOM_OF_PIPE, vk::AccessFlags2::empty())
            }
            _ => (vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE),
        };
        Self { layout, stage, access }
    }

    /// 刚创建、内容未定义的 image 的初始状态
    pub fn initial() -> Self {
        Self::for_layout(vk::ImageLayout::UNDEFINED)
    }
}

/// 一次待执行的 layout 转换。同一 src 状态的连续 subresource 已经合并
#[derive(Debug, PartialEq, Eq)]
pub struct GfxImageTransition {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub src: GfxImageState,
}

/// 追踪一张 image 所有 subresource 的状态
///
/// mip 和 layer 粒度；aspect 不参与区分
pub struct GfxImageStateTracker {
    mip_count: u32,
    layer_count: u32,
    /// 按 layer-major 排列：`states[layer * mip_count + mip]`
    states: Vec<GfxImageState>,
}

impl GfxImageStateTracker {
    pub fn new(mip_count: u32, layer_count: u32) -> Self {
        debug_assert!(mip_count > 0 && layer_count > 0);
        Self {
            mip_count,
            layer_count,
            states: vec![GfxImageState::initial(); (mip_count * layer_count) as usize],
        }
    }

    #[inline]
    pub fn state(&self, mip: u32, layer: u32) -> GfxImageState {
        debug_assert!(mip < self.mip_count && layer < self.layer_count);
        self.states[(layer * self.mip_count + mip) as usize]
    }

    /// 将指定范围转换到 `dst` 状态，返回需要执行的 barrier 列表
    ///
    /// - 已经处于 `dst` 状态的 subresource 不产生 barrier
    /// - src 状态相同的连续 mip/layer 合并为一条 barrier
    ///
    /// 只更新内部记录；调用方负责实际录制 barrier
    pub fn transition(
        &mut self,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
        dst: GfxImageState,
    ) -> Vec<GfxImageTransition> {
        assert!(base_mip + mip_count <= self.mip_count, "mip range out of bounds");
        assert!(base_layer + layer_count <= self.layer_count, "layer range out of bounds");

        // 每个 layer 内，先把 src 状态相同的连续 mip 合并成 run
        let mut per_layer_runs: Vec<Vec<(u32, u32, GfxImageState)>> = Vec::with_capacity(layer_count as usize);
        for layer in base_layer..base_layer + layer_count {
            let mut runs: Vec<(u32, u32, GfxImageState)> = Vec::new();
            for mip in base_mip..base_mip + mip_count {
                let src = self.state(mip, layer);
                if src == dst {
                    continue;
                }
                match runs.last_mut() {
                    Some((run_base, run_count, run_src)) if *run_base + *run_count == mip && *run_src == src => {
                        *run_count += 1;
                    }
                    _ => runs.push((mip, 1, src)),
                }
            }
            per_layer_runs.push(runs);
        }

        // run 列表完全相同的相邻 layer 合并
        let mut transitions: Vec<GfxImageTransition> = Vec::new();
        let mut layer = 0;
        while layer < per_layer_runs.len() {
            let mut merged_layers = 1;
            while layer + merged_layers < per_layer_runs.len()
                && per_layer_runs[layer + merged_layers] == per_layer_runs[layer]
            {
                merged_layers += 1;
            }
            for &(run_base, run_count, src) in &per_layer_runs[layer] {
                transitions.push(GfxImageTransition {
                    base_mip: run_base,
                    mip_count: run_count,
                    base_layer: base_layer + layer as u32,
                    layer_count: merged_layers as u32,
                    src,
                });
            }
            layer += merged_layers;
        }

        // 记录新状态
        for layer in base_layer..base_layer + layer_count {
            for mip in base_mip..base_mip + mip_count {
                self.states[(layer * self.mip_count + mip) as usize] = dst;
            }
        }

        transitions
    }

    /// 整张 image 转换到 `dst`
    #[inline]
    pub fn transition_all(&mut self, dst: GfxImageState) -> Vec<GfxImageTransition> {
        self.transition(0, self.mip_count, 0, self.layer_count, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(layout: vk::ImageLayout) -> GfxImageState {
        GfxImageState::for_layout(layout)
    }

    #[test]
    fn test_same_state_transition_is_noop() {
        let mut tracker = GfxImageStateTracker::new(4, 1);
        let dst = state(vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let first = tracker.transition_all(dst);
        assert_eq!(first.len(), 1);

        // 第二次转换到同一状态，不应产生任何 barrier
        let second = tracker.transition_all(dst);
        assert!(second.is_empty());
    }

    #[test]
    fn test_uniform_range_merges_to_single_barrier() {
        let mut tracker = GfxImageStateTracker::new(8, 6);
        let transitions = tracker.transition_all(state(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));

        assert_eq!(transitions.len(), 1);
        let t = &transitions[0];
        assert_eq!((t.base_mip, t.mip_count, t.base_layer, t.layer_count), (0, 8, 0, 6));
        assert_eq!(t.src, GfxImageState::initial());
    }

    #[test]
    fn test_partial_range_then_restore() {
        let mut tracker = GfxImageStateTracker::new(4, 1);
        let transfer_dst = state(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let shader_read = state(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        // 只转换 mip 1..3
        tracker.transition(1, 2, 0, 1, transfer_dst);
        assert_eq!(tracker.state(0, 0), GfxImageState::initial());
        assert_eq!(tracker.state(1, 0), transfer_dst);
        assert_eq!(tracker.state(2, 0), transfer_dst);
        assert_eq!(tracker.state(3, 0), GfxImageState::initial());

        // 整体转到 shader read：src 状态不同，必须拆成多条 barrier
        let transitions = tracker.transition_all(shader_read);
        assert_eq!(transitions.len(), 3);
        assert_eq!(transitions[0].src, GfxImageState::initial());
        assert_eq!((transitions[0].base_mip, transitions[0].mip_count), (0, 1));
        assert_eq!(transitions[1].src, transfer_dst);
        assert_eq!((transitions[1].base_mip, transitions[1].mip_count), (1, 2));
        assert_eq!((transitions[2].base_mip, transitions[2].mip_count), (3, 1));
    }

    #[test]
    fn test_a_b_a_round_trip_restores_state() {
        let mut tracker = GfxImageStateTracker::new(2, 2);
        let a = state(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let b = state(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        tracker.transition_all(a);
        tracker.transition_all(b);
        let back = tracker.transition_all(a);

        assert_eq!(back.len(), 1);
        assert_eq!(back[0].src, b);
        assert_eq!(tracker.state(0, 0), a);
        assert_eq!(tracker.state(1, 1), a);
    }

    #[test]
    fn test_identical_layers_merge() {
        let mut tracker = GfxImageStateTracker::new(2, 4);
        let transfer_dst = state(vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        // layer 0 和 layer 2..4 状态相同但不相邻，不能合并成一条
        tracker.transition(0, 2, 1, 1, transfer_dst);
        let transitions = tracker.transition_all(state(vk::ImageLayout::GENERAL));

        assert_eq!(transitions.len(), 3);
        assert_eq!((transitions[0].base_layer, transitions[0].layer_count), (0, 1));
        assert_eq!((transitions[1].base_layer, transitions[1].layer_count), (1, 1));
        assert_eq!((transitions[2].base_layer, transitions[2].layer_count), (2, 2));
    }

    #[test]
    #[should_panic(expected = "mip range out of bounds")]
    fn test_out_of_range_panics() {
        let mut tracker = GfxImageStateTracker::new(2, 1);
        tracker.transition(1, 2, 0, 1, state(vk::ImageLayout::GENERAL));
    }

    #[test]
    fn test_for_layout_is_deterministic() {
        let a = GfxImageState::for_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let b = GfxImageState::for_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(a, b);
        assert_eq!(a.stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(a.access, vk::AccessFlags2::TRANSFER_WRITE);
    }
}
