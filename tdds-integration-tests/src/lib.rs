//! Shared fixtures for the cross-crate scenario tests.

use std::borrow::Cow;
use std::sync::Once;
use std::sync::Arc;
use tdds_cdr::types::{build, Extensibility, Member, PrimitiveKind};
use tdds_cdr::{struct_value, DynValue, Type};

static TRACING: Once = Once::new();

/// Install the test log subscriber once per process. Controlled with
/// `RUST_LOG` as usual.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// The nested scenario type:
/// `{ string key; struct { int32 n } inner; int16[3] arr }`.
pub fn nested_type() -> Arc<Type> {
    let inner = build::structure(
        "Inner",
        Extensibility::Final,
        vec![Member::new("n", 0, build::primitive(PrimitiveKind::Int32))],
    );
    build::structure(
        "Nested",
        Extensibility::Final,
        vec![
            Member::new("key", 0, build::string(0)).key(),
            Member::new("inner", 1, inner),
            Member::new(
                "arr",
                2,
                build::array(build::primitive(PrimitiveKind::Int16), vec![3]),
            ),
        ],
    )
}

/// The canonical nested sample `{ "hi", { 42 }, [1, 2, 3] }`.
pub fn nested_sample() -> DynValue<'static> {
    struct_value(vec![
        (0, DynValue::Str(Cow::Borrowed("hi"))),
        (1, struct_value(vec![(0, DynValue::Int32(42))])),
        (
            2,
            DynValue::Array(vec![
                DynValue::Int16(1),
                DynValue::Int16(2),
                DynValue::Int16(3),
            ]),
        ),
    ])
}

/// Versioned mutable types for the extensibility scenarios.
pub mod versions {
    use super::*;

    /// v1: `{ m_id=1: int32 }`
    pub fn v1() -> Arc<Type> {
        build::structure(
            "Evolving",
            Extensibility::Mutable,
            vec![Member::new("a", 1, build::primitive(PrimitiveKind::Int32))],
        )
    }

    /// v2: `{ m_id=1: int32, m_id=2: string }`
    pub fn v2() -> Arc<Type> {
        build::structure(
            "Evolving",
            Extensibility::Mutable,
            vec![
                Member::new("a", 1, build::primitive(PrimitiveKind::Int32)),
                Member::new("b", 2, build::string(0)),
            ],
        )
    }

    /// v3: `{ m_id=1: int32, m_id=2: string, m_id=3: float }`
    pub fn v3() -> Arc<Type> {
        build::structure(
            "Evolving",
            Extensibility::Mutable,
            vec![
                Member::new("a", 1, build::primitive(PrimitiveKind::Int32)),
                Member::new("b", 2, build::string(0)),
                Member::new("f", 3, build::primitive(PrimitiveKind::Float32)),
            ],
        )
    }
}
