use shared::domain::Role;
use storage::Storage;

#[tokio::test]
async fn two_party_transcript_survives_reopen() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("transcript.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let (conversation_id, first, second) = {
        let storage = Storage::new(&database_url).await.expect("db");
        let patient = storage
            .create_user("p@example.com", "Patient P", Role::Patient, None)
            .await
            .expect("patient");
        let doctor = storage
            .create_user("d@example.com", "Doctor D", Role::Doctor, None)
            .await
            .expect("doctor");
        let (conversation, _) = storage
            .find_or_create_conversation(patient, doctor)
            .await
            .expect("conversation");
        let first = storage
            .insert_message(conversation.conversation_id, patient, "hello")
            .await
            .expect("hello");
        let second = storage
            .insert_message(conversation.conversation_id, doctor, "hi")
            .await
            .expect("hi");
        (conversation.conversation_id, first, second)
    };

    let reopened = Storage::new(&database_url).await.expect("reopen");
    let conversation = reopened
        .get_conversation(conversation_id)
        .await
        .expect("get")
        .expect("conversation persisted");
    assert_eq!(conversation.patient_id, first.sender_id);
    assert_eq!(conversation.doctor_id, second.sender_id);

    let transcript = reopened
        .list_conversation_messages(conversation_id)
        .await
        .expect("list");
    let contents: Vec<_> = transcript.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["hello", "hi"]);
    assert_eq!(transcript[1].sender_full_name, "Doctor D");
}
