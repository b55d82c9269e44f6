//! Test setup macros for reducing boilerplate across the engine test
//! suite.

/// Creates an engine over a fresh temporary directory.
///
/// # Syntax
///
/// ```text
/// test_engine!(db)          // direct disk managers
/// test_engine!(db, wal)     // write-ahead-log disk managers
/// ```
///
/// # Examples
///
/// ```
/// use testsupport::test_engine;
///
/// test_engine!(db);
/// assert!(db.catalogue().config().page_size > 0);
/// ```
#[macro_export]
macro_rules! test_engine {
    ($db:ident) => {
        let _dir = $crate::tempfile::tempdir().unwrap();
        let $db = ::engine::HareDb::open(
            ::common::Config::builder()
                .data_dir(_dir.path().to_path_buf())
                .buffer_pool_frames(16)
                .build(),
        )
        .unwrap();
    };
    ($db:ident, wal) => {
        let _dir = $crate::tempfile::tempdir().unwrap();
        let $db = ::engine::HareDb::open(
            ::common::Config::builder()
                .data_dir(_dir.path().to_path_buf())
                .buffer_pool_frames(16)
                .wal(true)
                .build(),
        )
        .unwrap();
    };
}

/// Builds the `(column, value)` pairs an entity insert takes.
///
/// # Examples
///
/// ```
/// use testsupport::vals;
/// use types::Value;
///
/// let row = vals!["id" => Value::String("a".into()), "n" => Value::Long(1)];
/// assert_eq!(row.len(), 2);
/// ```
#[macro_export]
macro_rules! vals {
    [$($name:expr => $value:expr),+ $(,)?] => {
        vec![$(($name.to_string(), $value)),+]
    };
}
