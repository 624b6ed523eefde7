use std::sync::Arc;

use anyhow::Result;
use taxo::classifier::TrainingStatus;
use taxo::{CategoryClassifier, Database, DocumentStore};

/// Seeds two categories with 15 labeled documents each, using disjoint
/// vocabularies so a trained model separates them cleanly.
fn seed_labeled_documents(store: &DocumentStore) -> Result<()> {
    let engineering = store.create_category("engineering", None)?;
    let cooking = store.create_category("cooking", None)?;

    for i in 0..15 {
        let doc = store.add_document(
            &format!("rust compiler borrow checker lifetimes traits iteration {i}"),
            None,
        )?;
        store.assign_category(doc.id(), engineering.id(), 1.0)?;

        let doc = store.add_document(
            &format!("braise the onions then simmer the broth gently batch {i}"),
            None,
        )?;
        store.assign_category(doc.id(), cooking.id(), 1.0)?;
    }
    Ok(())
}

#[test]
fn trains_from_labeled_documents_and_classifies() -> Result<()> {
    let db = Arc::new(Database::in_memory()?);
    let store = DocumentStore::new(Arc::clone(&db));
    seed_labeled_documents(&store)?;

    let classifier = CategoryClassifier::new(Arc::clone(&db));
    let report = classifier.train_model(None)?;

    assert_eq!(report.status, TrainingStatus::Trained);
    assert_eq!(report.data_point_count, 30);
    assert!(report.accuracy.expect("accuracy reported") > 0.9);

    let doc = store.add_document("the borrow checker and trait lifetimes", None)?;
    let top = classifier.classify_document(doc.id())?;
    assert_eq!(top.name, "engineering");

    // classify_document records the assignment on the document.
    let loaded = store.get_document(doc.id())?.expect("document exists");
    assert_eq!(loaded.category().map(|(id, _)| id), Some(top.category_id));
    Ok(())
}

#[test]
fn committed_model_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("taxo.db");

    {
        let db = Arc::new(Database::open(&db_path)?);
        let store = DocumentStore::new(Arc::clone(&db));
        seed_labeled_documents(&store)?;
        CategoryClassifier::new(db).train_model(None)?;
    }

    let db = Arc::new(Database::open(&db_path)?);
    let classifier = CategoryClassifier::new(db);
    assert!(classifier.load_committed()?);

    let scores = classifier.predict_category("simmer the onion broth")?;
    assert_eq!(scores[0].name, "cooking");

    let total: f64 = scores.iter().map(|s| s.probability).sum();
    assert!((total - 1.0).abs() < 1e-9);
    Ok(())
}

#[test]
fn predict_before_any_training_is_rejected() -> Result<()> {
    let db = Arc::new(Database::in_memory()?);
    let classifier = CategoryClassifier::new(db);

    assert!(!classifier.load_committed()?);
    let err = classifier.predict_category("anything").unwrap_err();
    assert!(matches!(err, taxo::Error::NotTrained));
    Ok(())
}
