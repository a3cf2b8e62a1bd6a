//! 请求调度器的记账测试。
//!
//! # 教案式说明
//! - **Why**：每个来源至多一个在途请求、完成只消费一次，是事件循环不泄漏请求的前提；
//! - **How**：用脚本化设备与手动定时器逐步推进，直接调用调度器的提交、消费与排空操作；
//! - **What**：覆盖幂等提交、两阶段读取、陈旧完成的回收以及“取消不等于完成”的语义。

mod support;

use std::time::Duration;

use futures::{executor::block_on, future::poll_fn};
use spark_serial_core::{
    ArmOutcome, DrainStatus, RequestScheduler, RequestState, SerialError, SourceKind,
};
use support::{Controls, ManualTimer, ScriptedDevice, harness};
use tracing_test::traced_test;

const PERIOD: Duration = Duration::from_secs(5);

fn scheduler() -> (RequestScheduler<ScriptedDevice, ManualTimer>, Controls) {
    let (device, timer, controls) = harness();
    (RequestScheduler::new(device, timer), controls)
}

fn wait_read(scheduler: &mut RequestScheduler<ScriptedDevice, ManualTimer>) {
    block_on(poll_fn(|cx| scheduler.poll_read_settled(cx)));
}

fn wait_timer(scheduler: &mut RequestScheduler<ScriptedDevice, ManualTimer>) {
    block_on(poll_fn(|cx| scheduler.poll_timer_settled(cx)));
}

#[test]
fn arming_is_idempotent_per_source() {
    let (mut scheduler, ctl) = scheduler();

    let first = scheduler.ensure_read_armed(50).expect("首次提交读请求");
    let ArmOutcome::Armed(id) = first else {
        panic!("首次提交必须真正发出请求: {first:?}");
    };
    assert_eq!(
        scheduler.ensure_read_armed(50).expect("重复提交"),
        ArmOutcome::AlreadyInFlight(id)
    );
    assert_eq!(ctl.device.issued(), 1);

    assert!(matches!(
        scheduler.ensure_timer_armed(PERIOD).expect("提交定时"),
        ArmOutcome::Armed(_)
    ));
    assert!(matches!(
        scheduler.ensure_timer_armed(PERIOD).expect("重复提交定时"),
        ArmOutcome::AlreadyInFlight(_)
    ));
    assert_eq!(ctl.timer.armed(), vec![PERIOD]);
    assert_eq!(scheduler.counters().reads_issued, 1);
    assert_eq!(scheduler.counters().timers_issued, 1);
}

#[test]
fn read_completion_concatenates_both_phases() {
    // Why: 第一阶段只等 1 字节，其余已缓冲字节由第二阶段同步取回，合并为一个字节块。
    let (mut scheduler, ctl) = scheduler();
    scheduler.ensure_read_armed(50).expect("提交读请求");
    ctl.device.push(b"hello\nworld\n");
    wait_read(&mut scheduler);

    let chunk = scheduler.on_read_complete().expect("读完成");
    assert_eq!(chunk.as_bytes(), b"hello\nworld\n");
    assert_eq!(scheduler.read_state(), RequestState::Idle);
    assert_eq!(ctl.device.buffered(), 0);
}

#[test]
fn read_completion_respects_raw_capacity() {
    let (mut scheduler, ctl) = scheduler();
    scheduler.ensure_read_armed(4).expect("提交读请求");
    ctl.device.push(b"abcdefgh");
    wait_read(&mut scheduler);

    let chunk = scheduler.on_read_complete().expect("读完成");
    assert_eq!(chunk.as_bytes(), b"abcd");
    assert_eq!(ctl.device.buffered(), 4, "超出上限的字节留在设备缓冲中");
}

#[test]
fn phase_two_failure_keeps_first_byte() {
    let (mut scheduler, ctl) = scheduler();
    scheduler.ensure_read_armed(50).expect("提交读请求");
    ctl.device.fail_query(true);
    ctl.device.push(b"xyz");
    wait_read(&mut scheduler);

    let chunk = scheduler.on_read_complete().expect("第二阶段失败不影响第一阶段字节");
    assert_eq!(chunk.as_bytes(), b"x");
}

#[test]
fn failed_read_is_reported_and_slot_returns_idle() {
    let (mut scheduler, ctl) = scheduler();
    scheduler.ensure_read_armed(50).expect("提交读请求");
    ctl.device.fail_pending("parity");
    wait_read(&mut scheduler);

    let err = scheduler.on_read_complete().expect_err("读请求以错误结束");
    assert!(matches!(err, SerialError::Read { .. }));
    assert_eq!(scheduler.read_state(), RequestState::Idle);
}

#[test]
fn consuming_idle_slot_is_a_stale_completion() {
    let (mut scheduler, _ctl) = scheduler();
    let err = scheduler.on_read_complete().expect_err("空闲槽位不能消费完成");
    assert!(matches!(
        err,
        SerialError::StaleCompletion {
            kind: SourceKind::Read
        }
    ));
    assert_eq!(scheduler.counters().anomalies, 1);
}

#[test]
fn consuming_unsettled_timer_cancels_it_and_forces_idle() {
    let (mut scheduler, ctl) = scheduler();
    scheduler.ensure_timer_armed(PERIOD).expect("提交定时");

    let err = scheduler.on_timer_complete().expect_err("未完成的请求不能被消费");
    assert!(matches!(
        err,
        SerialError::StaleCompletion {
            kind: SourceKind::Timer
        }
    ));
    assert_eq!(scheduler.timer_state(), RequestState::Idle);
    assert_eq!(ctl.timer.aborted(), 1, "被强制回收的请求必须先收到取消");
}

#[traced_test]
#[test]
fn leaked_timer_completion_is_reclaimed_before_rearm() {
    // Why: 已完成但未被消费的定时请求会让下一轮等待立即被无意义地唤醒，提交前必须回收。
    let (mut scheduler, ctl) = scheduler();
    let ArmOutcome::Armed(first) = scheduler.ensure_timer_armed(PERIOD).expect("提交定时") else {
        panic!("首次提交必须发出请求");
    };
    assert_eq!(ctl.timer.fire(PERIOD), 1);
    wait_timer(&mut scheduler);

    let outcome = scheduler.ensure_timer_armed(PERIOD).expect("回收后重新提交");
    assert!(matches!(outcome, ArmOutcome::Armed(id) if id != first));
    assert_eq!(scheduler.counters().anomalies, 1);
    assert!(logs_contain("leaked timer completion reclaimed"));
}

#[test]
fn retire_timer_cancels_then_drains() {
    let (mut scheduler, ctl) = scheduler();
    scheduler.ensure_timer_armed(PERIOD).expect("提交定时");

    let status = block_on(scheduler.retire_timer());
    assert!(matches!(status, DrainStatus::Completed));
    assert_eq!(scheduler.timer_state(), RequestState::Idle);
    assert_eq!(scheduler.counters().timers_retired, 1);
    assert_eq!(ctl.timer.aborted(), 1);
    assert_eq!(ctl.timer.pending(), 0);

    assert!(matches!(
        block_on(scheduler.retire_timer()),
        DrainStatus::Idle
    ));
}

#[test]
fn cancel_all_only_requests_cancellation() {
    // Why: 取消不等于完成；槽位在排空之前仍然在途，设备也不能被关闭。
    let (mut scheduler, ctl) = scheduler();
    scheduler.ensure_read_armed(50).expect("提交读请求");
    scheduler.ensure_timer_armed(PERIOD).expect("提交定时");

    scheduler.cancel_all();
    assert_eq!(ctl.device.aborted(), 1);
    assert_eq!(ctl.timer.aborted(), 1);
    assert!(scheduler.read_state().is_in_flight());
    assert!(scheduler.timer_state().is_in_flight());
    assert!(matches!(
        scheduler.close_device(),
        Err(SerialError::Close { .. })
    ));
    assert_eq!(ctl.device.close_calls(), 0);

    assert!(matches!(
        block_on(scheduler.drain_read(None)),
        DrainStatus::Completed
    ));
    assert!(matches!(
        block_on(scheduler.drain_timer(None)),
        DrainStatus::Completed
    ));
    assert!(scheduler.is_quiescent());
    scheduler.close_device().expect("排空后可以关闭设备");
    assert_eq!(ctl.device.close_calls(), 1);
}

#[test]
fn drain_reports_completion_that_beat_the_cancel() {
    let (mut scheduler, ctl) = scheduler();
    scheduler.ensure_read_armed(50).expect("提交读请求");
    ctl.device.push(b"z");
    wait_read(&mut scheduler);

    assert!(matches!(
        block_on(scheduler.drain_read(None)),
        DrainStatus::SettledBeforeCancel
    ));
    assert_eq!(ctl.device.aborted(), 0, "已完成的请求不再触发中止");
}
