//! 处理器 panic 现场记录
//!
//! `catch_unwind` 之后再取调用栈只能看到捕获点，看不到 panic 发生的位置。
//! 这里安装一次全局 panic hook：仅在处理器被轮询期间（当前线程已“布防”）
//! 把 panic 位置与调用栈存入线程局部槽位，捕获后由分发流程取出。
//! 其他 panic 原样交给先前的 hook。

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

/// panic 发生处的位置与调用栈
#[derive(Debug)]
pub(crate) struct PanicTrace {
    pub location: Option<String>,
    pub backtrace: Backtrace,
}

thread_local! {
    static ARMED: Cell<bool> = const { Cell::new(false) };
    static LAST: RefCell<Option<PanicTrace>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

fn install_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if ARMED.with(Cell::get) {
                let trace = PanicTrace {
                    location: info.location().map(ToString::to_string),
                    backtrace: Backtrace::force_capture(),
                };
                LAST.with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

/// 当前线程布防期间的守卫；unwind 时同样会解除
struct Armed {
    previous: bool,
}

impl Armed {
    fn arm() -> Self {
        Self {
            previous: ARMED.with(|armed| armed.replace(true)),
        }
    }
}

impl Drop for Armed {
    fn drop(&mut self) {
        ARMED.with(|armed| armed.set(self.previous));
    }
}

/// 包装处理器 future：每次轮询期间布防
pub(crate) struct Traced<F> {
    inner: Pin<Box<F>>,
}

pub(crate) fn traced<F: Future>(inner: F) -> Traced<F> {
    install_hook();
    LAST.with(|slot| slot.borrow_mut().take());
    Traced {
        inner: Box::pin(inner),
    }
}

impl<F: Future> Future for Traced<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _armed = Armed::arm();
        self.inner.as_mut().poll(cx)
    }
}

/// 取出当前线程最近一次布防期间的 panic 现场
pub(crate) fn take() -> Option<PanicTrace> {
    LAST.with(|slot| slot.borrow_mut().take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::panic::AssertUnwindSafe;

    #[inline(never)]
    fn faulting_step(line: &mut u32) {
        *line = line!() + 1;
        panic!("ledger out of balance");
    }

    #[tokio::test]
    async fn records_the_panic_site_not_the_catch_site() {
        let mut line = 0;
        let result = AssertUnwindSafe(traced(async {
            faulting_step(&mut line);
        }))
        .catch_unwind()
        .await;

        assert!(result.is_err());
        let trace = take().expect("panic site recorded");
        assert_eq!(
            trace.location.as_deref(),
            Some(format!("{}:{}:9", file!(), line).as_str())
        );
        assert!(take().is_none());
    }

    #[test]
    fn unarmed_panics_are_not_recorded() {
        install_hook();
        let result = std::panic::catch_unwind(|| panic!("outside any handler"));

        assert!(result.is_err());
        assert!(take().is_none());
    }
}
