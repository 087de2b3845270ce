//! Byte-level request and response filters.

use bytes::Bytes;

use super::InvokeContext;

/// Transforms request bytes on the way out and response bytes on the way in.
///
/// Output filters run in registration order, input filters in reverse.
pub trait Filter: Send + Sync + 'static {
    /// Transform response bytes.
    fn input(&self, data: Bytes, ctx: &InvokeContext) -> Bytes;

    /// Transform request bytes.
    fn output(&self, data: Bytes, ctx: &InvokeContext) -> Bytes;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reverse;

    impl Filter for Reverse {
        fn input(&self, data: Bytes, _ctx: &InvokeContext) -> Bytes {
            data.iter().rev().copied().collect::<Vec<_>>().into()
        }

        fn output(&self, data: Bytes, ctx: &InvokeContext) -> Bytes {
            self.input(data, ctx)
        }
    }

    #[test]
    fn test_filter_object_safety() {
        let filter: Box<dyn Filter> = Box::new(Reverse);
        let ctx = InvokeContext::default();
        let out = filter.output(Bytes::from_static(b"abc"), &ctx);
        assert_eq!(&filter.input(out, &ctx)[..], b"abc");
    }
}
