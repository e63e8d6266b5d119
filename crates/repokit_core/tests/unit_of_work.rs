mod common;

use common::{
    count_rows, line, open_context, open_file_context, test_engine, user, OrderLine, User,
};
use repokit_core::{
    CancellationToken, IsolationLevel, RepoError, Repository, RepositoryBase, RepositoryHandle,
    ResolveError, ServiceCollection, ServiceEngine, SqlRepository, UnitOfWork, UowError,
};
use std::rc::Rc;
use std::sync::Arc;

#[test]
fn repositories_share_the_unit_of_work_context() {
    let context = open_context();
    let mut uow = UnitOfWork::with_engine(context.clone(), test_engine());

    let users = uow.repository_for::<User>().unwrap();
    let again = uow.repository_for::<User>().unwrap();
    assert!(Rc::ptr_eq(&users, &again));

    let lines = uow.get_repository::<Rc<SqlRepository<OrderLine>>>().unwrap();
    assert!(Rc::ptr_eq(&users.context().unwrap(), &context));
    assert!(Rc::ptr_eq(&lines.context().unwrap(), &context));
    assert_eq!(uow.repository_count(), 2);
    assert_eq!(uow.repository_names().len(), 2);
}

#[test]
fn without_transaction_writes_persist_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("auto.db");
    let mut uow = UnitOfWork::with_engine(open_file_context(&path), test_engine());

    let users = uow.repository_for::<User>().unwrap();
    let ada = users.add(user("Ada", "ada@example.com")).unwrap();

    assert_eq!(count_rows(&path, "users"), 1);
    assert_eq!(users.get_by_id(&ada.id.into()).unwrap(), Some(ada));
    assert_eq!(uow.commit().unwrap(), 0);
}

#[test]
fn commit_persists_every_repository_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("atomic.db");
    let mut uow = UnitOfWork::with_engine(open_file_context(&path), test_engine());

    uow.begin_transaction().unwrap();
    let users = uow.repository_for::<User>().unwrap();
    let lines = uow.repository_for::<OrderLine>().unwrap();
    let ada = users.add(user("Ada", "ada@example.com")).unwrap();
    lines
        .add_range(vec![line(1, 1, "apple", 2), line(1, 2, "pear", 1)])
        .unwrap();

    assert_eq!(users.get_by_id(&ada.id.into()).unwrap(), None);
    assert_eq!(count_rows(&path, "users"), 0);
    assert_eq!(count_rows(&path, "order_lines"), 0);

    assert_eq!(uow.commit().unwrap(), 3);
    assert!(!uow.has_transaction());
    assert_eq!(count_rows(&path, "users"), 1);
    assert_eq!(count_rows(&path, "order_lines"), 2);
    assert_eq!(users.get_by_id(&ada.id.into()).unwrap(), Some(ada));
}

#[test]
fn commit_failure_rolls_back_everything() {
    let context = open_context();
    let mut uow = UnitOfWork::with_engine(context.clone(), test_engine());

    uow.begin_transaction().unwrap();
    let users = uow.repository_for::<User>().unwrap();
    let lines = uow.repository_for::<OrderLine>().unwrap();
    lines.add(line(9, 1, "fig", 4)).unwrap();
    users.add(user("Ada", "dup@example.com")).unwrap();
    users.add(user("Eve", "dup@example.com")).unwrap();

    let err = uow.commit().unwrap_err();
    assert!(matches!(err, UowError::Transaction(RepoError::Db(_))));
    assert!(!uow.has_transaction());
    assert!(!users.has_transaction());
    assert!(!context.borrow().in_transaction());
    assert!(!context.borrow().tracker().has_changes());

    assert!(users.get_all_read_only(&[]).unwrap().is_empty());
    assert!(lines.get_all_read_only(&[]).unwrap().is_empty());
}

#[test]
fn failed_write_then_drop_leaves_nothing_behind() {
    let context = open_context();
    {
        let mut uow = UnitOfWork::with_engine(context.clone(), test_engine());
        uow.begin_transaction().unwrap();
        let lines = uow.repository_for::<OrderLine>().unwrap();
        let users = uow.repository_for::<User>().unwrap();

        lines.add(line(1, 1, "apple", 1)).unwrap();
        let err = users.add(user("", "nobody@example.com")).unwrap_err();
        assert!(matches!(err, RepoError::Validation { entity: "users", .. }));
    }

    assert!(!context.borrow().in_transaction());
    let lines = SqlRepository::<OrderLine>::with_context(&context);
    assert!(lines.get_all_read_only(&[]).unwrap().is_empty());
}

#[test]
fn failed_range_keeps_earlier_deletes_for_commit() {
    let context = open_context();
    let mut uow = UnitOfWork::with_engine(context.clone(), test_engine());
    let users = uow.repository_for::<User>().unwrap();
    let ada = users.add(user("Ada", "ada@example.com")).unwrap();

    uow.begin_transaction().unwrap();
    users.delete(ada.clone()).unwrap();
    let bob = user("Bob", "bob@example.com");
    let err = users.add_range(vec![ada, bob.clone(), bob]).unwrap_err();
    assert!(matches!(err, RepoError::DuplicateKey { entity: "users", .. }));

    assert_eq!(uow.commit().unwrap(), 1);
    assert!(users.get_all_read_only(&[]).unwrap().is_empty());
}

#[test]
fn rollback_discards_staged_changes_and_resets_flag() {
    let context = open_context();
    let mut uow = UnitOfWork::with_engine(context.clone(), test_engine());
    let users = uow.repository_for::<User>().unwrap();
    users.add(user("Ada", "ada@example.com")).unwrap();

    uow.begin_transaction_with(IsolationLevel::RepeatableRead).unwrap();
    assert!(users.has_transaction());
    users.add(user("Bob", "bob@example.com")).unwrap();
    uow.rollback().unwrap();

    assert!(!uow.has_transaction());
    assert!(!users.has_transaction());
    let stored = users.get_all_read_only(&[]).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "Ada");
}

#[test]
fn rollback_without_transaction_rejects_pending_changes() {
    let context = open_context();
    let mut uow = UnitOfWork::with_engine(context.clone(), test_engine());
    let users = uow.repository_for::<User>().unwrap();
    users.set_has_transaction(true);
    users.add(user("Ada", "ada@example.com")).unwrap();
    assert!(context.borrow().tracker().has_changes());

    uow.rollback().unwrap();
    assert!(!context.borrow().tracker().has_changes());
    assert!(!users.has_transaction());
}

#[test]
fn second_begin_reuses_the_open_transaction() {
    let context = open_context();
    let mut uow = UnitOfWork::with_engine(context.clone(), test_engine());
    uow.begin_transaction().unwrap();
    uow.begin_transaction().unwrap();
    assert!(context.borrow().in_transaction());

    uow.commit().unwrap();
    assert!(!context.borrow().in_transaction());
}

#[test]
fn registered_repositories_take_the_current_flag() {
    let context = open_context();
    let mut uow = UnitOfWork::with_engine(context.clone(), test_engine());
    uow.begin_transaction().unwrap();

    let custom = uow.register(Rc::new(SqlRepository::<User>::new()));
    assert!(custom.has_transaction());
    assert!(custom.context().is_some());
    assert!(RepositoryHandle::repository_name(&custom).contains("SqlRepository"));

    uow.commit().unwrap();
    assert!(!custom.has_transaction());
}

#[test]
fn unregistered_handles_report_resolution_errors() {
    let mut uow = UnitOfWork::with_engine(
        open_context(),
        Arc::new(ServiceEngine::with_services(ServiceCollection::new(), "Test")),
    );
    let err = uow
        .get_repository::<Rc<SqlRepository<User>>>()
        .unwrap_err();
    assert!(matches!(err, UowError::Resolve(ResolveError::NotRegistered(_))));

    // The entity shortcut falls back to the constructor table.
    let users = uow.repository_for::<User>().unwrap();
    users.add(user("Ada", "ada@example.com")).unwrap();
    assert_eq!(users.get_all_read_only(&[]).unwrap().len(), 1);
}

#[test]
fn repositories_outliving_the_unit_of_work_are_unbound() {
    let users = {
        let mut uow = UnitOfWork::with_engine(open_context(), test_engine());
        uow.repository_for::<User>().unwrap()
    };
    assert!(matches!(
        users.add(user("Ada", "ada@example.com")),
        Err(RepoError::Unbound(_))
    ));
}

#[tokio::test]
async fn async_writes_commit_through_the_unit_of_work() {
    let context = open_context();
    let mut uow = UnitOfWork::with_engine(context.clone(), test_engine());
    let cancel = CancellationToken::new();

    uow.begin_transaction().unwrap();
    let lines = uow.repository_for::<OrderLine>().unwrap();
    lines
        .add_range_async(vec![line(5, 1, "kiwi", 1), line(5, 2, "plum", 2)], &cancel)
        .await
        .unwrap();
    assert!(lines
        .get_all_read_only_async(&[], &cancel)
        .await
        .unwrap()
        .is_empty());

    assert_eq!(uow.commit().unwrap(), 2);
    assert_eq!(
        lines.get_all_read_only_async(&[], &cancel).await.unwrap().len(),
        2
    );
}
