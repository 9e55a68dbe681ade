mod common;

use std::rc::Rc;

use anyhow::Result;
use common::{Journal, TestContext, TestRuntime, on_worker_thread};
use worker_runtime::{Error, WorkerObserver, install_factory};

// The factory is process-wide, so every step lives in one test.
#[test]
fn installed_factory_backs_get_current() -> Result<()> {
    let journal = Journal::default();

    let before = on_worker_thread(|| WorkerObserver::get_current().map(|_| ()));
    assert!(matches!(before, Err(Error::NoFactory)));

    let factory_journal = journal.clone();
    install_factory(move || TestRuntime::new(&factory_journal).into_config())?;
    assert!(matches!(
        install_factory(|| TestRuntime::default().into_config()),
        Err(Error::FactoryAlreadyInstalled)
    ));

    let worker_journal = journal.clone();
    on_worker_thread(move || -> Result<()> {
        let first = WorkerObserver::get_current()?;
        let second = WorkerObserver::get_current()?;
        assert!(Rc::ptr_eq(&first, &second));

        let context = TestContext::new(1, &worker_journal);
        first.context_created(&context)?;
        first.context_will_destroy(&context)?;

        let replacement = WorkerObserver::get_current()?;
        assert!(!Rc::ptr_eq(&first, &replacement));
        Ok(())
    })?;

    assert!(journal.contains("initialize context#1"));
    assert_eq!(journal.count("clear_archives registered=false"), 2);
    Ok(())
}
